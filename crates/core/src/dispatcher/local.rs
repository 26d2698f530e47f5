use super::{DispatchEvent, DispatchOutcome, TaskDispatcher, TaskSubmission};
use crate::config::BrokerConfig;
use crate::error::{OrchestratorError, Result};
use crate::types::{DispatchHandle, InstanceId, TaskId};
use anyhow::{anyhow, Context};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Result of a task handler
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    pub limit: Option<Vec<TaskId>>,
}

impl TaskOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            limit: None,
        }
    }

    pub fn with_limit<I, S>(mut self, successors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.limit = Some(successors.into_iter().map(TaskId::new).collect());
        self
    }
}

/// Worker-side execution of the tasks routed to one queue
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskSubmission) -> anyhow::Result<TaskOutput>;
}

/// Returns its payload and input as the result.
///
/// A `limit` array in the payload is passed through as the successor limit.
pub struct EchoHandler;

#[async_trait::async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &TaskSubmission) -> anyhow::Result<TaskOutput> {
        let output = TaskOutput::new(serde_json::json!({
            "task": task.name,
            "payload": task.payload,
            "input": task.input,
        }));

        match task.payload.get("limit") {
            Some(limit) => {
                let limit: Vec<String> =
                    serde_json::from_value(limit.clone()).context("limit must be a list of task ids")?;
                Ok(output.with_limit(limit))
            }
            None => Ok(output),
        }
    }
}

/// Runs `payload.command` through `sh -c`.
///
/// The task input is passed as JSON in `DAGRUN_INPUT`. Stdout becomes the
/// result, parsed as JSON when possible; a non-zero exit fails the task.
pub struct CommandHandler;

#[async_trait::async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, task: &TaskSubmission) -> anyhow::Result<TaskOutput> {
        let command = task
            .payload
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("payload has no command"))?;

        tracing::info!("Running command for task {}: {}", task.task_id, command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("DAGRUN_INPUT", task.input.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning command for task {}", task.task_id))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let result = serde_json::from_str(&stdout).unwrap_or(serde_json::Value::String(stdout));
        Ok(TaskOutput::new(result))
    }
}

struct Retained {
    instance: InstanceId,
    value: serde_json::Value,
    stored_at: Instant,
}

#[derive(Default)]
struct Shared {
    events: HashMap<InstanceId, Vec<DispatchEvent>>,
    results: HashMap<DispatchHandle, Retained>,
    /// Submitted tasks that have not reported their outcome yet
    in_flight: HashMap<InstanceId, usize>,
    /// Released instances whose in-flight tasks are still running
    released: HashSet<InstanceId>,
}

impl Shared {
    fn report(&mut self, instance: InstanceId, event: DispatchEvent) {
        if self.released.contains(&instance) {
            tracing::debug!(
                "Dropping report for task {} of released instance {}",
                event.task_id,
                instance
            );
            return;
        }
        self.events.entry(instance).or_default().push(event);
    }

    fn retain(&mut self, instance: InstanceId, handle: DispatchHandle, value: serde_json::Value) {
        if self.released.contains(&instance) {
            return;
        }
        self.results.insert(
            handle,
            Retained {
                instance,
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn finish(&mut self, instance: InstanceId) {
        let remaining = match self.in_flight.get_mut(&instance) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.in_flight.remove(&instance);
            self.released.remove(&instance);
        }
    }

    fn release(&mut self, instance: InstanceId) {
        self.events.remove(&instance);
        self.results.retain(|_, r| r.instance != instance);
        if self.in_flight.contains_key(&instance) {
            self.released.insert(instance);
        }
    }
}

/// In-process worker pool.
///
/// Each submission runs on its own tokio task once a worker slot is free.
/// The worker reports `Started` when it takes a slot and then the outcome;
/// successful results are retained until forgotten, expired or released.
#[derive(Clone)]
pub struct LocalDispatcher {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    slots: Arc<Semaphore>,
    shared: Arc<Mutex<Shared>>,
    result_expires: Option<Duration>,
}

impl LocalDispatcher {
    pub fn new(worker_concurrency: usize, result_expires_secs: u64) -> Self {
        Self {
            handlers: HashMap::new(),
            slots: Arc::new(Semaphore::new(worker_concurrency.max(1))),
            shared: Arc::new(Mutex::new(Shared::default())),
            result_expires: (result_expires_secs > 0)
                .then(|| Duration::from_secs(result_expires_secs)),
        }
    }

    /// Pool with the built-in handlers: `task` echoes, `shell` runs commands
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        if !config.is_local() {
            return Err(OrchestratorError::Config(format!(
                "unsupported broker url: {}",
                config.url
            )));
        }

        Ok(Self::new(config.worker_concurrency, config.result_expires)
            .with_handler("task", EchoHandler)
            .with_handler("shell", CommandHandler))
    }

    pub fn with_handler(mut self, queue: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.insert(queue.into(), Arc::new(handler));
        self
    }

    /// A retained result, if it has been neither forgotten nor expired
    pub fn result(&self, handle: &DispatchHandle) -> Option<serde_json::Value> {
        let mut shared = self.lock();
        self.prune(&mut shared);
        shared.results.get(handle).map(|r| r.value.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    fn prune(&self, shared: &mut Shared) {
        if let Some(ttl) = self.result_expires {
            shared.results.retain(|_, r| r.stored_at.elapsed() < ttl);
        }
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait::async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn submit(&self, submission: TaskSubmission) -> Result<DispatchHandle> {
        let handler = self
            .handlers
            .get(&submission.queue)
            .cloned()
            .ok_or_else(|| OrchestratorError::DispatchRejected {
                task: submission.task_id.clone(),
                reason: format!("no worker consumes queue {}", submission.queue),
            })?;

        let handle = DispatchHandle::generate();
        let slots = self.slots.clone();
        let shared = self.shared.clone();
        let worker_handle = handle.clone();
        *self
            .lock()
            .in_flight
            .entry(submission.instance_id)
            .or_default() += 1;

        tokio::spawn(async move {
            let instance = submission.instance_id;
            let task_id = submission.task_id.clone();

            let Ok(_permit) = slots.acquire_owned().await else {
                lock_shared(&shared).finish(instance);
                return;
            };

            lock_shared(&shared).report(
                instance,
                DispatchEvent {
                    handle: worker_handle.clone(),
                    task_id: task_id.clone(),
                    outcome: DispatchOutcome::Started,
                },
            );

            let (retained, outcome) = match handler.handle(&submission).await {
                Ok(output) => (
                    Some(output.result.clone()),
                    DispatchOutcome::Completed {
                        result: output.result,
                        limit: output.limit,
                    },
                ),
                Err(e) => {
                    tracing::warn!("Task {} of {} failed: {:#}", task_id, instance, e);
                    (
                        None,
                        DispatchOutcome::Failed {
                            error: format!("{:#}", e),
                        },
                    )
                }
            };

            let mut guard = lock_shared(&shared);
            if let Some(value) = retained {
                guard.retain(instance, worker_handle.clone(), value);
            }
            guard.report(
                instance,
                DispatchEvent {
                    handle: worker_handle,
                    task_id,
                    outcome,
                },
            );
            guard.finish(instance);
        });

        Ok(handle)
    }

    async fn poll_completions(&self, instance: InstanceId) -> Result<Vec<DispatchEvent>> {
        let mut shared = self.lock();
        self.prune(&mut shared);
        Ok(shared.events.remove(&instance).unwrap_or_default())
    }

    async fn forget(&self, handle: &DispatchHandle) -> Result<()> {
        self.lock().results.remove(handle);
        Ok(())
    }

    async fn release(&self, instance: InstanceId) -> Result<()> {
        self.lock().release(instance);
        Ok(())
    }
}
