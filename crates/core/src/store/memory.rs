use super::{StateStore, Versioned, WriteOutcome};
use crate::error::Result;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// In-process store for tests and single-node `memory` deployments
#[derive(Default)]
pub struct MemoryStateStore {
    documents: RwLock<BTreeMap<String, Versioned>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        let mut documents = self.documents.write().await;
        let version = documents.get(key).map(|d| d.version + 1).unwrap_or(1);
        documents.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn conditional_write(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        // The write lock makes compare and swap one atomic step
        let mut documents = self.documents.write().await;
        let current = documents.get(key).map(|d| d.version);
        if current != expected {
            return Ok(WriteOutcome::Conflict { current });
        }

        let version = current.map(|v| v + 1).unwrap_or(1);
        documents.insert(key.to_string(), Versioned { version, value });
        Ok(WriteOutcome::Written { version })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.documents.write().await.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let documents = self.documents.read().await;
        Ok(documents
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
