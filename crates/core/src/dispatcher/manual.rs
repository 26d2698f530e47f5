use super::{DispatchEvent, DispatchOutcome, TaskDispatcher, TaskSubmission};
use crate::error::{OrchestratorError, Result};
use crate::types::{DispatchHandle, InstanceId, TaskId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ManualState {
    submissions: Vec<(DispatchHandle, TaskSubmission)>,
    events: HashMap<InstanceId, Vec<DispatchEvent>>,
    forgotten: Vec<DispatchHandle>,
    released: Vec<InstanceId>,
    rejected: HashSet<TaskId>,
    unavailable: bool,
}

/// Dispatcher whose workers are the caller: submissions are recorded and
/// outcomes are injected by hand. Drives schedulers deterministically in tests.
#[derive(Default)]
pub struct ManualDispatcher {
    state: Mutex<ManualState>,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every submission so far, in order
    pub fn submissions(&self) -> Vec<TaskSubmission> {
        self.lock().submissions.iter().map(|(_, s)| s.clone()).collect()
    }

    /// Ids of submitted tasks for one instance, in order
    pub fn submitted(&self, instance: InstanceId) -> Vec<TaskId> {
        self.lock()
            .submissions
            .iter()
            .filter(|(_, s)| s.instance_id == instance)
            .map(|(_, s)| s.task_id.clone())
            .collect()
    }

    /// Handle of the latest submission of a task
    pub fn handle_of(&self, instance: InstanceId, task: &str) -> Option<DispatchHandle> {
        self.lock()
            .submissions
            .iter()
            .rev()
            .find(|(_, s)| s.instance_id == instance && s.task_id.as_str() == task)
            .map(|(h, _)| h.clone())
    }

    /// Queue an arbitrary event, including stale or duplicate ones
    pub fn deliver(&self, instance: InstanceId, event: DispatchEvent) {
        self.lock().events.entry(instance).or_default().push(event);
    }

    fn report(&self, instance: InstanceId, task: &str, outcome: DispatchOutcome) -> bool {
        match self.handle_of(instance, task) {
            Some(handle) => {
                self.deliver(
                    instance,
                    DispatchEvent {
                        handle,
                        task_id: TaskId::new(task),
                        outcome,
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn ack(&self, instance: InstanceId, task: &str) -> bool {
        self.report(instance, task, DispatchOutcome::Started)
    }

    pub fn complete(&self, instance: InstanceId, task: &str, result: serde_json::Value) -> bool {
        self.report(
            instance,
            task,
            DispatchOutcome::Completed {
                result,
                limit: None,
            },
        )
    }

    pub fn complete_with_limit(
        &self,
        instance: InstanceId,
        task: &str,
        result: serde_json::Value,
        limit: &[&str],
    ) -> bool {
        self.report(
            instance,
            task,
            DispatchOutcome::Completed {
                result,
                limit: Some(limit.iter().map(|t| TaskId::new(*t)).collect()),
            },
        )
    }

    pub fn fail(&self, instance: InstanceId, task: &str, error: impl Into<String>) -> bool {
        self.report(
            instance,
            task,
            DispatchOutcome::Failed {
                error: error.into(),
            },
        )
    }

    /// Handles the scheduler asked to forget
    pub fn forgotten(&self) -> Vec<DispatchHandle> {
        self.lock().forgotten.clone()
    }

    /// Instances the runner released, in order
    pub fn released(&self) -> Vec<InstanceId> {
        self.lock().released.clone()
    }

    /// Reject every future submission of this task
    pub fn reject(&self, task: &str) {
        self.lock().rejected.insert(TaskId::new(task));
    }

    /// Make every call fail transiently until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for ManualDispatcher {
    async fn submit(&self, submission: TaskSubmission) -> Result<DispatchHandle> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(OrchestratorError::DispatcherUnavailable(
                "manual dispatcher offline".to_string(),
            ));
        }
        if state.rejected.contains(&submission.task_id) {
            return Err(OrchestratorError::DispatchRejected {
                task: submission.task_id,
                reason: "rejected by test".to_string(),
            });
        }

        let handle = DispatchHandle::generate();
        state.submissions.push((handle.clone(), submission));
        Ok(handle)
    }

    async fn poll_completions(&self, instance: InstanceId) -> Result<Vec<DispatchEvent>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(OrchestratorError::DispatcherUnavailable(
                "manual dispatcher offline".to_string(),
            ));
        }
        Ok(state.events.remove(&instance).unwrap_or_default())
    }

    async fn forget(&self, handle: &DispatchHandle) -> Result<()> {
        self.lock().forgotten.push(handle.clone());
        Ok(())
    }

    async fn release(&self, instance: InstanceId) -> Result<()> {
        let mut state = self.lock();
        state.events.remove(&instance);
        state.released.push(instance);
        Ok(())
    }
}
