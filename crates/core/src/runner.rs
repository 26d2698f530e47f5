use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{OrchestratorError, Result};
use crate::graph::GraphModel;
use crate::lease::{HeldLease, LeaseManager};
use crate::scheduler::{DagScheduler, SchedulerContext, SchedulerExit, SchedulerReport, SchedulerSettings};
use crate::signal::{Signal, SignalChannel};
use crate::store::records::definition_key;
use crate::store::InstanceStore;
use crate::types::{
    DagDefinition, InstanceId, RunnerId, TaskId, TaskRecord, WorkflowInstance, WorkflowState,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub poll_interval: std::time::Duration,
    pub max_concurrent_instances: usize,
}

impl RunnerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            poll_interval: config.runner.workflow_polling_interval(),
            max_concurrent_instances: config.runner.max_concurrent_instances,
        }
    }
}

/// Best-known state of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub state: WorkflowState,
    pub last_error: Option<String>,
    pub lease_holder: Option<RunnerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An instance with its input and task records
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub summary: InstanceSummary,
    pub input: serde_json::Value,
    pub tasks: Vec<TaskRecord>,
}

struct ActiveScheduler {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Discovers runnable instances, leases them and drives each with its own
/// [`DagScheduler`] task. Also the entry point for lifecycle operations.
#[derive(Clone)]
pub struct WorkflowRunner {
    runner_id: RunnerId,
    ctx: SchedulerContext,
    settings: RunnerSettings,
    active: Arc<Mutex<HashMap<InstanceId, ActiveScheduler>>>,
}

impl WorkflowRunner {
    pub fn new(
        runner_id: RunnerId,
        config: &OrchestratorConfig,
        records: InstanceStore,
        signals: Arc<dyn SignalChannel>,
        dispatcher: Arc<dyn TaskDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let leases = LeaseManager::new(records.clone(), clock.clone(), config.runner.lease_ttl());
        Self {
            runner_id,
            ctx: SchedulerContext {
                records,
                leases,
                signals,
                dispatcher,
                clock,
                settings: SchedulerSettings::from_config(config),
            },
            settings: RunnerSettings::from_config(config),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    /// Validate a definition and persist it with a new `created` instance
    pub async fn submit(&self, definition: DagDefinition, input: serde_json::Value) -> Result<InstanceId> {
        let now = self.ctx.clock.now();
        let graph = GraphModel::from_definition(&definition, now)?;

        let id = InstanceId::new();
        self.ctx.records.put_definition(id, &definition).await?;
        for task in graph.topological_order() {
            self.ctx.records.put_task(&graph.to_record(id, &task)?).await?;
        }
        self.ctx
            .records
            .put_instance(&WorkflowInstance {
                id,
                name: definition.name.clone(),
                definition_ref: definition_key(id),
                state: WorkflowState::Created,
                input,
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        tracing::info!(
            "Submitted workflow {} ({}) with {} tasks",
            id,
            definition.name,
            definition.tasks.len()
        );
        Ok(id)
    }

    pub async fn get(&self, id: InstanceId) -> Result<InstanceView> {
        let instance = match self.ctx.records.get_instance(id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return Err(OrchestratorError::NotFound(format!("workflow instance {}", id))),
            Err(e @ OrchestratorError::StoreCorruption { .. }) => {
                failed_placeholder(id, &e, self.ctx.clock.now())
            }
            Err(e) => return Err(e),
        };

        let tasks = match self.ctx.records.load_tasks(id).await {
            Ok(tasks) => tasks,
            Err(e) if !e.is_transient() => {
                tracing::warn!("Task records of {} unreadable: {}", id, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let input = instance.input.clone();
        Ok(InstanceView {
            summary: self.summarize(instance).await?,
            input,
            tasks,
        })
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>> {
        let now = self.ctx.clock.now();
        let mut summaries = Vec::new();

        for id in self.ctx.records.instance_ids().await? {
            let instance = match self.ctx.records.get_instance(id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e @ OrchestratorError::StoreCorruption { .. }) => failed_placeholder(id, &e, now),
                Err(e) => return Err(e),
            };
            summaries.push(self.summarize(instance).await?);
        }

        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    async fn summarize(&self, instance: WorkflowInstance) -> Result<InstanceSummary> {
        let lease_holder = match self.ctx.leases.current(instance.id).await {
            Ok(lease) => lease.map(|l| l.holder),
            Err(e) if !e.is_transient() => None,
            Err(e) => return Err(e),
        };

        Ok(InstanceSummary {
            id: instance.id,
            name: instance.name,
            state: instance.state,
            last_error: instance.last_error,
            lease_holder,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        })
    }

    /// Cooperative stop: no new dispatch, in-flight tasks run to completion
    pub async fn stop(&self, id: InstanceId) -> Result<()> {
        let instance = self.ctx.records.load_instance(id).await?;
        match instance.state {
            WorkflowState::Created => self.finish_unowned(id, WorkflowState::Stopped).await,
            WorkflowState::Running | WorkflowState::Stopping => {
                self.ctx.signals.publish(Signal::stop(id, self.ctx.clock.now())).await
            }
            state => Err(OrchestratorError::InvalidTransition {
                instance: id,
                state,
                operation: "stop",
            }),
        }
    }

    /// Forcible abort: every non-terminal task is skipped without waiting
    pub async fn abort(&self, id: InstanceId) -> Result<()> {
        let instance = self.ctx.records.load_instance(id).await?;
        match instance.state {
            WorkflowState::Created => self.finish_unowned(id, WorkflowState::Aborted).await,
            WorkflowState::Running | WorkflowState::Stopping | WorkflowState::Aborting => {
                self.ctx.signals.publish(Signal::abort(id, self.ctx.clock.now())).await
            }
            state => Err(OrchestratorError::InvalidTransition {
                instance: id,
                state,
                operation: "abort",
            }),
        }
    }

    /// Publish a custom signal to a live instance
    pub async fn signal(
        &self,
        id: InstanceId,
        name: &str,
        payload: serde_json::Value,
        task: Option<TaskId>,
    ) -> Result<()> {
        let instance = self.ctx.records.load_instance(id).await?;
        if instance.state.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                instance: id,
                state: instance.state,
                operation: "signal",
            });
        }
        self.ctx
            .signals
            .publish(Signal::custom(id, name, payload, task, self.ctx.clock.now()))
            .await
    }

    /// Move a `created` instance nobody drives yet straight to `target`.
    ///
    /// Falls back to a signal when a scheduler got there first.
    async fn finish_unowned(&self, id: InstanceId, target: WorkflowState) -> Result<()> {
        let lease = match self.ctx.leases.acquire(id, &self.runner_id).await {
            Ok(lease) => lease,
            Err(OrchestratorError::LeaseConflict { .. }) => return self.signal_owner(id, target).await,
            Err(e) => return Err(e),
        };

        let result = self.finish_leased(id, target).await;
        self.release(lease).await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => self.signal_owner(id, target).await,
            Err(e) => Err(e),
        }
    }

    async fn finish_leased(&self, id: InstanceId, target: WorkflowState) -> Result<bool> {
        let mut instance = self.ctx.records.load_instance(id).await?;
        if instance.state != WorkflowState::Created {
            return Ok(false);
        }

        let now = self.ctx.clock.now();
        if target == WorkflowState::Aborted {
            let definition = self.ctx.records.load_definition(&instance.definition_ref).await?;
            let mut graph = GraphModel::from_definition(&definition, now)?;
            for task in graph.skip_all(now) {
                self.ctx.records.put_task(&graph.to_record(id, &task)?).await?;
            }
        }

        instance.state = target;
        instance.updated_at = now;
        self.ctx.records.put_instance(&instance).await?;
        settle(&self.ctx, id).await;
        tracing::info!("Workflow {} moved from created to {}", id, target);
        Ok(true)
    }

    async fn signal_owner(&self, id: InstanceId, target: WorkflowState) -> Result<()> {
        let now = self.ctx.clock.now();
        let signal = match target {
            WorkflowState::Aborted => Signal::abort(id, now),
            _ => Signal::stop(id, now),
        };
        self.ctx.signals.publish(signal).await
    }

    /// One discovery pass; returns how many schedulers were started
    pub async fn poll_once(&self) -> Result<usize> {
        self.reap().await;
        let mut started = 0;

        for id in self.ctx.records.instance_ids().await? {
            {
                let active = self.active.lock().await;
                if active.contains_key(&id) {
                    continue;
                }
                if active.len() >= self.settings.max_concurrent_instances {
                    tracing::debug!("Runner {} at capacity", self.runner_id);
                    break;
                }
            }

            let instance = match self.ctx.records.get_instance(id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e @ OrchestratorError::StoreCorruption { .. }) => {
                    self.reconcile_corrupt(id, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !instance.state.needs_scheduler() {
                continue;
            }

            match self.ctx.leases.acquire(id, &self.runner_id).await {
                Ok(lease) => {
                    self.spawn(id, lease).await;
                    started += 1;
                }
                Err(OrchestratorError::LeaseConflict { holder, .. }) => {
                    tracing::debug!(
                        "Workflow {} is leased by {:?}, skipping this cycle",
                        id,
                        holder.map(|h| h.0)
                    );
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => tracing::warn!("Cannot lease workflow {}: {}", id, e),
            }
        }

        Ok(started)
    }

    /// Poll on the workflow cadence until `cancel` fires, then shut down
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Runner {} started", self.runner_id);

        let period = self
            .settings
            .poll_interval
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(started) => tracing::debug!("Runner {} started {} schedulers", self.runner_id, started),
                Err(e) => tracing::error!("Runner {} poll failed: {}", self.runner_id, e),
            }
        }

        self.shutdown().await;
        tracing::info!("Runner {} stopped", self.runner_id);
    }

    /// Cancel every scheduler and wait for them to release their leases
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.active.lock().await.drain().collect();
        for (_, active) in &drained {
            active.cancel.cancel();
        }
        for (id, active) in drained {
            if let Err(e) = active.handle.await {
                tracing::warn!("Scheduler for {} ended abnormally: {}", id, e);
            }
        }
    }

    /// Instances this runner is currently driving
    pub async fn active_instances(&self) -> Vec<InstanceId> {
        self.active.lock().await.keys().copied().collect()
    }

    async fn reap(&self) {
        self.active
            .lock()
            .await
            .retain(|_, active| !active.handle.is_finished());
    }

    async fn spawn(&self, id: InstanceId, lease: HeldLease) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(self.ctx.clone(), id, lease, cancel.clone()));
        self.active
            .lock()
            .await
            .insert(id, ActiveScheduler { handle, cancel });
    }

    /// Surface an undecodable instance record as a failed instance
    async fn reconcile_corrupt(&self, id: InstanceId, error: &OrchestratorError) {
        let lease = match self.ctx.leases.acquire(id, &self.runner_id).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::debug!("Cannot lease corrupt workflow {}: {}", id, e);
                return;
            }
        };

        tracing::error!("Workflow {} has a corrupt record, marking it failed: {}", id, error);
        let placeholder = failed_placeholder(id, error, self.ctx.clock.now());
        match self.ctx.records.put_instance(&placeholder).await {
            Ok(()) => settle(&self.ctx, id).await,
            Err(e) => tracing::error!("Could not mark workflow {} failed: {}", id, e),
        }
        self.release(lease).await;
    }

    async fn release(&self, lease: HeldLease) {
        release(&self.ctx, lease).await;
    }
}

/// Body of a spawned scheduler task: load, run, then record the outcome
async fn drive(ctx: SchedulerContext, id: InstanceId, lease: HeldLease, cancel: CancellationToken) {
    let scheduler = match DagScheduler::load(ctx.clone(), id, lease.clone()).await {
        Ok(scheduler) => scheduler,
        Err(e) if e.is_transient() => {
            tracing::error!("Could not load workflow {}, will retry: {}", id, e);
            release(&ctx, lease).await;
            return;
        }
        Err(e) => {
            tracing::error!("Workflow {} cannot be loaded: {}", id, e);
            match mark_terminal(&ctx, id, WorkflowState::Failed, Some(e.to_string())).await {
                Ok(()) => settle(&ctx, id).await,
                Err(write_err) => {
                    tracing::error!("Could not mark workflow {} failed: {}", id, write_err)
                }
            }
            release(&ctx, lease).await;
            return;
        }
    };

    let report = scheduler.run(cancel).await;
    finish(&ctx, report).await;
}

async fn finish(ctx: &SchedulerContext, report: SchedulerReport) {
    let id = report.instance_id;
    match report.exit {
        SchedulerExit::Finished(state) => {
            match mark_terminal(ctx, id, state, report.last_error).await {
                Ok(()) => {
                    settle(ctx, id).await;
                    tracing::info!("Workflow {} finished as {}", id, state);
                }
                Err(e) => tracing::error!("Could not record outcome of workflow {}: {}", id, e),
            }
            release(ctx, report.lease).await;
        }
        SchedulerExit::LeaseLost => {}
        SchedulerExit::Cancelled => {
            tracing::info!("Scheduler for workflow {} cancelled", id);
            release(ctx, report.lease).await;
        }
    }
}

async fn mark_terminal(
    ctx: &SchedulerContext,
    id: InstanceId,
    state: WorkflowState,
    last_error: Option<String>,
) -> Result<()> {
    let now = ctx.clock.now();
    let mut instance = match ctx.records.get_instance(id).await {
        Ok(Some(instance)) => instance,
        Ok(None) => return Err(OrchestratorError::NotFound(format!("workflow instance {}", id))),
        Err(e @ OrchestratorError::StoreCorruption { .. }) => failed_placeholder(id, &e, now),
        Err(e) => return Err(e),
    };

    instance.state = state;
    if last_error.is_some() {
        instance.last_error = last_error;
    }
    instance.updated_at = now;
    ctx.records.put_instance(&instance).await
}

/// Drop what the collaborators still keep for an instance that is now terminal
async fn settle(ctx: &SchedulerContext, id: InstanceId) {
    if let Err(e) = ctx.dispatcher.release(id).await {
        tracing::warn!("Could not release dispatcher state of {}: {}", id, e);
    }
    if let Err(e) = ctx.signals.discard(id).await {
        tracing::warn!("Could not discard pending signals of {}: {}", id, e);
    }
}

async fn release(ctx: &SchedulerContext, lease: HeldLease) {
    let id = lease.instance;
    if let Err(e) = ctx.leases.release(lease).await {
        tracing::warn!("Could not release lease on {}: {}", id, e);
    }
}

fn failed_placeholder(id: InstanceId, error: &OrchestratorError, now: DateTime<Utc>) -> WorkflowInstance {
    WorkflowInstance {
        id,
        name: String::new(),
        definition_ref: definition_key(id),
        state: WorkflowState::Failed,
        input: serde_json::Value::Null,
        last_error: Some(error.to_string()),
        created_at: now,
        updated_at: now,
    }
}
