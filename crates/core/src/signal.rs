//! Out-of-band coordination signals scoped to a workflow instance.

use crate::error::{OrchestratorError, Result};
use crate::store::records::signal_prefix;
use crate::store::InstanceStore;
use crate::types::{InstanceId, TaskId, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const STOP: &str = "stop";
pub const ABORT: &str = "abort";

/// A named, payload-bearing message for one instance (optionally one task)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub task: Option<TaskId>,
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    pub fn custom(
        instance_id: InstanceId,
        name: impl Into<String>,
        payload: serde_json::Value,
        task: Option<TaskId>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            name: name.into(),
            payload,
            task,
            sent_at,
        }
    }

    pub fn stop(instance_id: InstanceId, sent_at: DateTime<Utc>) -> Self {
        Self::custom(instance_id, STOP, serde_json::Value::Null, None, sent_at)
    }

    pub fn abort(instance_id: InstanceId, sent_at: DateTime<Utc>) -> Self {
        Self::custom(instance_id, ABORT, serde_json::Value::Null, None, sent_at)
    }

    pub fn kind(&self) -> SignalKind {
        match self.name.as_str() {
            STOP => SignalKind::Stop,
            ABORT => SignalKind::Abort,
            other => SignalKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Stop,
    Abort,
    Custom(String),
}

/// Transport for signals.
///
/// Delivery is at least once; `poll` drains what is pending for an instance
/// and never blocks waiting for more.
#[async_trait::async_trait]
pub trait SignalChannel: Send + Sync {
    async fn publish(&self, signal: Signal) -> Result<()>;

    async fn poll(&self, instance: InstanceId) -> Result<Vec<Signal>>;

    /// Drop everything still pending for an instance that has finished
    async fn discard(&self, instance: InstanceId) -> Result<()>;
}

/// In-process channel, for tests and single-process deployments
#[derive(Default)]
pub struct MemorySignalChannel {
    pending: Mutex<HashMap<InstanceId, Vec<Signal>>>,
}

impl MemorySignalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SignalChannel for MemorySignalChannel {
    async fn publish(&self, signal: Signal) -> Result<()> {
        self.pending
            .lock()
            .await
            .entry(signal.instance_id)
            .or_default()
            .push(signal);
        Ok(())
    }

    async fn poll(&self, instance: InstanceId) -> Result<Vec<Signal>> {
        Ok(self
            .pending
            .lock()
            .await
            .remove(&instance)
            .unwrap_or_default())
    }

    async fn discard(&self, instance: InstanceId) -> Result<()> {
        self.pending.lock().await.remove(&instance);
        Ok(())
    }
}

/// Channel that keeps pending signals as store documents, so every runner
/// sharing the store sees them
#[derive(Clone)]
pub struct StoreSignalChannel {
    records: InstanceStore,
}

impl StoreSignalChannel {
    pub fn new(records: InstanceStore) -> Self {
        Self { records }
    }

    fn key(signal: &Signal) -> String {
        let nanos = signal.sent_at.timestamp_nanos_opt().unwrap_or_default();
        format!(
            "{}{:020}-{}",
            signal_prefix(signal.instance_id),
            nanos,
            signal.id
        )
    }
}

#[async_trait::async_trait]
impl SignalChannel for StoreSignalChannel {
    async fn publish(&self, signal: Signal) -> Result<()> {
        let key = Self::key(&signal);
        self.records.put(&key, &signal).await
    }

    async fn poll(&self, instance: InstanceId) -> Result<Vec<Signal>> {
        let keys = self.records.keys(&signal_prefix(instance)).await?;
        let mut signals = Vec::with_capacity(keys.len());

        for key in keys {
            match self.records.get::<Signal>(&key).await {
                Ok(Some(signal)) => signals.push(signal),
                Ok(None) => continue,
                Err(OrchestratorError::StoreCorruption { reason, .. }) => {
                    tracing::warn!("Dropping undecodable signal {}: {}", key, reason);
                }
                Err(e) => return Err(e),
            }
            self.records.delete(&key).await?;
        }

        Ok(signals)
    }

    async fn discard(&self, instance: InstanceId) -> Result<()> {
        for key in self.records.keys(&signal_prefix(instance)).await? {
            self.records.delete(&key).await?;
        }
        Ok(())
    }
}

/// Applies stop and abort at most once per scheduler, so redelivered
/// signals are absorbed
#[derive(Debug, Default, Clone)]
pub struct SignalLatch {
    stop: bool,
    abort: bool,
}

impl SignalLatch {
    /// Latch state implied by a persisted instance state, for a resumed scheduler
    pub fn from_state(state: WorkflowState) -> Self {
        Self {
            stop: state == WorkflowState::Stopping,
            abort: state == WorkflowState::Aborting,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    pub fn abort_requested(&self) -> bool {
        self.abort
    }

    /// The effect a signal still has, or `None` if it was already applied
    pub fn apply(&mut self, signal: &Signal) -> Option<SignalKind> {
        match signal.kind() {
            SignalKind::Abort if self.abort => None,
            SignalKind::Abort => {
                self.abort = true;
                Some(SignalKind::Abort)
            }
            SignalKind::Stop if self.stop || self.abort => None,
            SignalKind::Stop => {
                self.stop = true;
                Some(SignalKind::Stop)
            }
            custom => Some(custom),
        }
    }
}
