//! Typed access to instance, definition and task documents.
//!
//! Key layout:
//!
//! ```text
//! workflows/{instance}         WorkflowInstance
//! definitions/{instance}       DagDefinition (private copy per instance)
//! tasks/{instance}/{task}      TaskRecord
//! leases/{instance}            Lease
//! signals/{instance}/{seq}     Signal
//! ```

use super::{StateStore, Versioned};
use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;
use crate::types::{DagDefinition, InstanceId, TaskId, TaskRecord, WorkflowInstance};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub const WORKFLOWS_PREFIX: &str = "workflows/";

pub fn workflow_key(id: InstanceId) -> String {
    format!("{}{}", WORKFLOWS_PREFIX, id)
}

pub fn definition_key(id: InstanceId) -> String {
    format!("definitions/{}", id)
}

pub fn task_prefix(id: InstanceId) -> String {
    format!("tasks/{}/", id)
}

pub fn task_key(id: InstanceId, task: &TaskId) -> String {
    format!("{}{}", task_prefix(id), task)
}

pub fn lease_key(id: InstanceId) -> String {
    format!("leases/{}", id)
}

pub fn signal_prefix(id: InstanceId) -> String {
    format!("signals/{}/", id)
}

/// Record-level view of the state store with retry on transient failures
#[derive(Clone)]
pub struct InstanceStore {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

impl InstanceStore {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn raw(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Read a raw versioned document
    pub async fn read_versioned(&self, key: &str) -> Result<Option<Versioned>> {
        self.retry.run("store read", || self.store.read(key)).await
    }

    /// Read and decode a document
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_versioned(key).await? {
            Some(doc) => decode(key, doc.value).map(Some),
            None => Ok(None),
        }
    }

    /// Encode and write a document
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| OrchestratorError::corruption(key, e))?;
        self.retry
            .run("store write", || self.store.write(key, value.clone()))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.retry.run("store delete", || self.store.delete(key)).await
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry
            .run("store list", || self.store.list_by_prefix(prefix))
            .await
    }

    pub async fn put_definition(&self, id: InstanceId, definition: &DagDefinition) -> Result<()> {
        self.put(&definition_key(id), definition).await
    }

    pub async fn load_definition(&self, key: &str) -> Result<DagDefinition> {
        self.get(key)
            .await?
            .ok_or_else(|| OrchestratorError::corruption(key, "definition is missing"))
    }

    pub async fn put_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.put(&workflow_key(instance.id), instance).await
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Option<WorkflowInstance>> {
        self.get(&workflow_key(id)).await
    }

    pub async fn load_instance(&self, id: InstanceId) -> Result<WorkflowInstance> {
        self.get_instance(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow instance {}", id)))
    }

    /// Identities of every stored instance; keys that do not parse are corrupt
    pub async fn instance_ids(&self) -> Result<Vec<InstanceId>> {
        let keys = self.keys(WORKFLOWS_PREFIX).await?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            let raw = &key[WORKFLOWS_PREFIX.len()..];
            match InstanceId::parse(raw) {
                Some(id) => ids.push(id),
                None => tracing::warn!("Ignoring workflow key with malformed identity: {}", key),
            }
        }
        Ok(ids)
    }

    pub async fn put_task(&self, record: &TaskRecord) -> Result<()> {
        self.put(&task_key(record.instance_id, &record.id), record)
            .await
    }

    /// Every persisted task record of an instance
    pub async fn load_tasks(&self, id: InstanceId) -> Result<Vec<TaskRecord>> {
        let keys = self.keys(&task_prefix(id)).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get::<TaskRecord>(&key).await? {
                if record.instance_id != id {
                    return Err(OrchestratorError::corruption(
                        key,
                        format!("record belongs to instance {}", record.instance_id),
                    ));
                }
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| OrchestratorError::corruption(key, e))
}
