//! Error taxonomy for the orchestration core.

use crate::types::{InstanceId, RunnerId, TaskId, TaskState, WorkflowState};

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised by the graph model, scheduler, runner and their collaborators.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The dependency edges contain a cycle; the path closes on its first element.
    #[error("DAG contains a dependency cycle: {}", format_path(.0))]
    CyclicGraph(Vec<TaskId>),

    /// An edge references a task that is not defined in the DAG.
    #[error("Task {task} depends on undefined task {missing}")]
    DanglingReference { task: TaskId, missing: TaskId },

    /// Two nodes share one identity.
    #[error("Task {0} is defined more than once")]
    DuplicateTask(TaskId),

    /// Transient store failure, retried with backoff.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record could not be decoded; fatal for the owning instance.
    #[error("Corrupt record at {key}: {reason}")]
    StoreCorruption { key: String, reason: String },

    /// A dispatched task produced neither ack nor report before its deadline.
    #[error("Task {task} exceeded its dispatch deadline of {timeout_secs}s")]
    DispatchTimeout { task: TaskId, timeout_secs: u64 },

    /// Another runner holds an unexpired lease on the instance.
    #[error("Instance {instance} is leased by {}", holder_label(.holder))]
    LeaseConflict {
        instance: InstanceId,
        holder: Option<RunnerId>,
    },

    /// Renewal failed because the lease was taken over or released.
    #[error("Lost lease for instance {0}")]
    LeaseLost(InstanceId),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Lifecycle operation not allowed in the instance's current state.
    #[error("Cannot {operation} instance {instance} in state {state}")]
    InvalidTransition {
        instance: InstanceId,
        state: WorkflowState,
        operation: &'static str,
    },

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// The dispatcher rejected a submission outright.
    #[error("Dispatch of task {task} rejected: {reason}")]
    DispatchRejected { task: TaskId, reason: String },

    /// The dispatcher could not be reached; retried on the next poll.
    #[error("Task dispatcher unavailable: {0}")]
    DispatcherUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Infrastructure errors that are retried locally rather than recorded against an instance.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::DispatcherUnavailable(_))
    }

    /// Errors that reject a DAG definition before anything executes.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::CyclicGraph(_) | Self::DanglingReference { .. } | Self::DuplicateTask(_)
        )
    }

    pub fn corruption(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StoreCorruption {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(reason.to_string())
    }
}

fn holder_label(holder: &Option<RunnerId>) -> &str {
    holder.as_ref().map(|h| h.0.as_str()).unwrap_or("another runner")
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
