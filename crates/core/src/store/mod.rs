//! Durable state: the abstract key/document store, its backends, and the
//! typed record layer the scheduler and runner work through.

pub mod memory;
pub mod records;
pub mod redb_store;

pub use memory::MemoryStateStore;
pub use records::InstanceStore;
pub use redb_store::RedbStateStore;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A stored document together with its write version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: serde_json::Value,
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    /// The stored version did not match the expected one
    Conflict { current: Option<u64> },
}

/// Key/document store shared by every runner process.
///
/// All operations may fail with `StoreUnavailable`; a document that cannot be
/// decoded is reported as `StoreCorruption`.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Read a document, `None` if the key does not exist
    async fn read(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditionally write a document, returning its new version
    async fn write(&self, key: &str, value: serde_json::Value) -> Result<u64>;

    /// Write only if the stored version equals `expected` (`None` = key must be absent)
    async fn conditional_write(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<WriteOutcome>;

    /// Remove a document; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in lexicographic order
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
