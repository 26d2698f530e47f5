use super::{StateStore, Versioned, WriteOutcome};
use crate::error::{OrchestratorError, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// State store backed by an embedded redb database.
///
/// Each document is kept as JSON together with its version, so a conditional
/// write is a single read-compare-insert inside one write transaction.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(OrchestratorError::unavailable)?;
        }

        let db = Database::create(&path).map_err(OrchestratorError::unavailable)?;

        // Initialize the table so read transactions can always open it
        let write_txn = db.begin_write().map_err(OrchestratorError::unavailable)?;
        {
            let _documents = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;
        }
        write_txn.commit().map_err(OrchestratorError::unavailable)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn encode(key: &str, doc: &Versioned) -> Result<Vec<u8>> {
        serde_json::to_vec(doc).map_err(|e| OrchestratorError::corruption(key, e))
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Versioned> {
        serde_json::from_slice(bytes).map_err(|e| OrchestratorError::corruption(key, e))
    }
}

#[async_trait::async_trait]
impl StateStore for RedbStateStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        let read_txn = self.db.begin_read().map_err(OrchestratorError::unavailable)?;
        let table = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(OrchestratorError::unavailable)?;

        let value = table.get(key).map_err(OrchestratorError::unavailable)?;
        match value {
            Some(guard) => Ok(Some(Self::decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::unavailable)?;
        let version = {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;

            let current = match table.get(key).map_err(OrchestratorError::unavailable)? {
                Some(guard) => Some(Self::decode(key, guard.value())?.version),
                None => None,
            };
            let version = current.map(|v| v + 1).unwrap_or(1);
            let bytes = Self::encode(key, &Versioned { version, value })?;
            table
                .insert(key, bytes.as_slice())
                .map_err(OrchestratorError::unavailable)?;
            version
        };
        write_txn.commit().map_err(OrchestratorError::unavailable)?;
        Ok(version)
    }

    async fn conditional_write(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::unavailable)?;
        let outcome = {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;

            let current = match table.get(key).map_err(OrchestratorError::unavailable)? {
                Some(guard) => Some(Self::decode(key, guard.value())?.version),
                None => None,
            };

            if current != expected {
                WriteOutcome::Conflict { current }
            } else {
                let version = current.map(|v| v + 1).unwrap_or(1);
                let bytes = Self::encode(key, &Versioned { version, value })?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(OrchestratorError::unavailable)?;
                WriteOutcome::Written { version }
            }
        };

        match outcome {
            WriteOutcome::Written { .. } => {
                write_txn.commit().map_err(OrchestratorError::unavailable)?
            }
            WriteOutcome::Conflict { .. } => {
                write_txn.abort().map_err(OrchestratorError::unavailable)?
            }
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::unavailable)?;
        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;
            table.remove(key).map_err(OrchestratorError::unavailable)?;
        }
        write_txn.commit().map_err(OrchestratorError::unavailable)?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read().map_err(OrchestratorError::unavailable)?;
        let table = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(OrchestratorError::unavailable)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..).map_err(OrchestratorError::unavailable)? {
            let (key, _value) = item.map_err(OrchestratorError::unavailable)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }

        Ok(keys)
    }
}

#[cfg(test)]
impl RedbStateStore {
    fn put(&self, key: &str, doc: &Versioned) -> Result<()> {
        let bytes = Self::encode(key, doc)?;
        let write_txn = self.db.begin_write().map_err(OrchestratorError::unavailable)?;
        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(OrchestratorError::unavailable)?;
        }
        write_txn.commit().map_err(OrchestratorError::unavailable)?;
        Ok(())
    }

    /// Overwrite a raw document, bypassing encoding (used to simulate damaged records)
    fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::unavailable)?;
        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(OrchestratorError::unavailable)?;
            table.insert(key, bytes).map_err(OrchestratorError::unavailable)?;
        }
        write_txn.commit().map_err(OrchestratorError::unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> RedbStateStore {
        RedbStateStore::new(temp_dir.path().join("state.redb")).unwrap()
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        assert_eq!(store.write("workflows/1", json!({"state": "created"})).await.unwrap(), 1);
        assert_eq!(store.write("workflows/1", json!({"state": "running"})).await.unwrap(), 2);

        let doc = store.read("workflows/1").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.value["state"], "running");
    }

    #[tokio::test]
    async fn test_conditional_write_conflicts_on_stale_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store.put(
            "leases/1",
            &Versioned {
                version: 4,
                value: json!({"holder": "a"}),
            },
        )
        .unwrap();

        let stale = store
            .conditional_write("leases/1", Some(3), json!({"holder": "b"}))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict { current: Some(4) });

        let ok = store
            .conditional_write("leases/1", Some(4), json!({"holder": "b"}))
            .await
            .unwrap();
        assert_eq!(ok, WriteOutcome::Written { version: 5 });
        assert_eq!(store.read("leases/1").await.unwrap().unwrap().value["holder"], "b");
    }

    #[tokio::test]
    async fn test_prefix_listing_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store.write("signals/1/0002", json!(null)).await.unwrap();
        store.write("signals/1/0001", json!(null)).await.unwrap();
        store.write("signals/2/0001", json!(null)).await.unwrap();

        let keys = store.list_by_prefix("signals/1/").await.unwrap();
        assert_eq!(keys, vec!["signals/1/0001", "signals/1/0002"]);

        store.delete("signals/1/0001").await.unwrap();
        store.delete("signals/1/0001").await.unwrap();
        assert_eq!(store.list_by_prefix("signals/1/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_document_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store.put_raw("workflows/broken", b"{not json").unwrap();

        let err = store.read("workflows/broken").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StoreCorruption { .. }));
    }
}
