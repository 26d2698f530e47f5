// Core of the dagrun workflow orchestrator: DAG model, schedulers, runner

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod lease;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use dispatcher::{LocalDispatcher, ManualDispatcher, TaskDispatcher};
pub use error::{OrchestratorError, Result};
pub use graph::GraphModel;
pub use lease::LeaseManager;
pub use retry::RetryPolicy;
pub use runner::{InstanceSummary, InstanceView, WorkflowRunner};
pub use scheduler::DagScheduler;
pub use signal::{MemorySignalChannel, Signal, SignalChannel, StoreSignalChannel};
pub use store::{InstanceStore, MemoryStateStore, RedbStateStore, StateStore};
pub use types::*;
