use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task node, unique within its DAG
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a runner process competing for instance leases
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerId(pub String);

impl RunnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random runner ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle returned by the dispatcher for one submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchHandle(pub String);

impl DispatchHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Stopping,
    Stopped,
    Aborting,
    Aborted,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Aborted | Self::Completed | Self::Failed
        )
    }

    /// States the runner picks up and drives with a scheduler
    pub fn needs_scheduler(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Running | Self::Stopping | Self::Aborting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a single task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Ready,
    Dispatched,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Submitted to the dispatcher and not yet reported back
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// A predecessor in this state poisons its successors
    pub fn poisons_successors(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }

    /// Whether the scheduler may move a node from `self` to `to`
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Waiting, Ready)
                | (Waiting, Skipped)
                | (Ready, Dispatched)
                | (Ready, Failed)
                | (Ready, Skipped)
                | (Dispatched, Running)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static definition of a DAG: its task nodes and their dependency edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDefinition {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

/// Specification for a single task node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    /// Worker queue the task is routed to
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Opaque payload handed to the worker
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub predecessors: Vec<TaskId>,
    /// Overrides the configured dispatch deadline
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Labels under which a predecessor's result is also exposed in this task's input
    #[serde(default)]
    pub slots: HashMap<TaskId, String>,
}

pub fn default_queue() -> String {
    "task".to_string()
}

impl TaskSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: TaskId(id),
            queue: default_queue(),
            payload: serde_json::Value::Null,
            predecessors: Vec::new(),
            timeout_secs: None,
            slots: HashMap::new(),
        }
    }

    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predecessors
            .extend(predecessors.into_iter().map(|p| TaskId(p.into())));
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_slot(mut self, predecessor: impl Into<String>, label: impl Into<String>) -> Self {
        self.slots.insert(TaskId(predecessor.into()), label.into());
        self
    }
}

/// Persisted record of a workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub name: String,
    /// Store key of the DAG definition this instance executes
    pub definition_ref: String,
    pub state: WorkflowState,
    /// Initial data handed to the entry tasks
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted record of one task node of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub state: TaskState,
    pub predecessors: Vec<TaskId>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dispatch_handle: Option<DispatchHandle>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

/// Ownership claim on an instance, stored next to the instance record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: RunnerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
