//! Task dispatch: submission of ready tasks to a worker pool and polled
//! completion reporting.

pub mod local;
pub mod manual;

pub use local::{CommandHandler, EchoHandler, LocalDispatcher, TaskHandler, TaskOutput};
pub use manual::ManualDispatcher;

use crate::error::Result;
use crate::types::{DispatchHandle, InstanceId, TaskId};
use serde::{Deserialize, Serialize};

/// Everything a worker needs to execute one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub name: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Aggregated predecessor results, or the instance input for entry tasks
    pub input: serde_json::Value,
    pub attempt: u32,
}

/// What a worker reported about a submission
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The worker picked the task up
    Started,
    Completed {
        result: serde_json::Value,
        /// Successors allowed to run; the rest are skipped
        limit: Option<Vec<TaskId>>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub handle: DispatchHandle,
    pub task_id: TaskId,
    pub outcome: DispatchOutcome,
}

/// Worker pool collaborator.
///
/// Completions are pulled by the owning scheduler on its loop cadence; nothing
/// is pushed. Events are scoped per instance so schedulers sharing one
/// dispatcher only see their own.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Hand a task to the pool.
    ///
    /// `DispatchRejected` means the task can never run as submitted;
    /// `DispatcherUnavailable` is transient and the task stays ready.
    async fn submit(&self, submission: TaskSubmission) -> Result<DispatchHandle>;

    /// Drain reports for one instance
    async fn poll_completions(&self, instance: InstanceId) -> Result<Vec<DispatchEvent>>;

    /// Drop a retained result once nothing needs it
    async fn forget(&self, _handle: &DispatchHandle) -> Result<()> {
        Ok(())
    }

    /// The instance is terminal: drop its undrained reports and retained
    /// results, and discard whatever its in-flight tasks report later
    async fn release(&self, instance: InstanceId) -> Result<()>;
}
