use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::dispatcher::{DispatchEvent, DispatchOutcome, TaskDispatcher, TaskSubmission};
use crate::error::{OrchestratorError, Result};
use crate::graph::GraphModel;
use crate::lease::{HeldLease, LeaseManager};
use crate::signal::{Signal, SignalChannel, SignalKind, SignalLatch};
use crate::store::InstanceStore;
use crate::types::{InstanceId, TaskId, TaskState, WorkflowInstance, WorkflowState};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Cadence and deadlines for one scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: std::time::Duration,
    pub signal_interval: Duration,
    pub lease_renew_interval: Duration,
    pub dispatch_timeout_secs: u64,
    pub forget_consumed_results: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            poll_interval: config.runner.dag_polling_interval(),
            signal_interval: Duration::from_std(config.signal.polling_interval())
                .unwrap_or_else(|_| Duration::zero()),
            lease_renew_interval: config.runner.lease_renew_interval(),
            dispatch_timeout_secs: config.runner.dispatch_timeout_secs,
            forget_consumed_results: config.broker.forget_consumed_results(),
        }
    }
}

/// Collaborators shared by every scheduler a runner starts
#[derive(Clone)]
pub struct SchedulerContext {
    pub records: InstanceStore,
    pub leases: LeaseManager,
    pub signals: Arc<dyn SignalChannel>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub clock: Arc<dyn Clock>,
    pub settings: SchedulerSettings,
}

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    /// The loop is done; the instance should be moved to this state
    Finished(WorkflowState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Finished(WorkflowState),
    /// Renewal failed; another runner owns the instance now
    LeaseLost,
    Cancelled,
}

/// What a finished scheduler hands back to its runner
#[derive(Debug)]
pub struct SchedulerReport {
    pub instance_id: InstanceId,
    pub exit: SchedulerExit,
    pub lease: HeldLease,
    pub last_error: Option<String>,
}

/// Drives one workflow instance to a terminal state.
///
/// Holds the instance lease for its whole life, so it is the only writer of
/// the instance's task records. It writes the intermediate instance states
/// (running, stopping, aborting); the terminal state is written by the runner
/// from the returned [`SchedulerReport`].
pub struct DagScheduler {
    ctx: SchedulerContext,
    instance: WorkflowInstance,
    graph: GraphModel,
    lease: HeldLease,
    latch: SignalLatch,
    last_signal_poll: Option<DateTime<Utc>>,
    forgotten: HashSet<TaskId>,
}

impl DagScheduler {
    /// Rebuild scheduler state from the store under a held lease
    pub async fn load(ctx: SchedulerContext, instance_id: InstanceId, lease: HeldLease) -> Result<Self> {
        let now = ctx.clock.now();
        let instance = ctx.records.load_instance(instance_id).await?;
        let definition = ctx.records.load_definition(&instance.definition_ref).await?;
        let mut graph = GraphModel::from_definition(&definition, now)?;

        let mut restored = HashSet::new();
        for record in ctx.records.load_tasks(instance_id).await? {
            graph.restore(&record)?;
            restored.insert(record.id);
        }
        for task in graph.topological_order() {
            if !restored.contains(&task) {
                ctx.records
                    .put_task(&graph.to_record(instance_id, &task)?)
                    .await?;
            }
        }

        let latch = SignalLatch::from_state(instance.state);
        let mut scheduler = Self {
            ctx,
            instance,
            graph,
            lease,
            latch,
            last_signal_poll: None,
            forgotten: HashSet::new(),
        };

        match scheduler.instance.state {
            WorkflowState::Created => {
                scheduler.set_state(WorkflowState::Running, now).await?;
                tracing::info!(
                    "Started workflow {} ({}) with {} tasks",
                    instance_id,
                    scheduler.graph.name(),
                    scheduler.graph.len()
                );
            }
            state => {
                tracing::info!("Resumed workflow {} in state {}", instance_id, state);
            }
        }

        Ok(scheduler)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance.id
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    /// Poll until the instance finishes, the lease is lost or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> SchedulerReport {
        let period = self
            .ctx
            .settings
            .poll_interval
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SchedulerExit::Cancelled,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(PollOutcome::Continue) => {}
                Ok(PollOutcome::Finished(state)) => break SchedulerExit::Finished(state),
                Err(OrchestratorError::LeaseLost(id)) => {
                    tracing::warn!("Lost lease on workflow {}, stopping its scheduler", id);
                    break SchedulerExit::LeaseLost;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(
                        "Workflow {} poll failed after retries, continuing: {}",
                        self.instance.id,
                        e
                    );
                    self.instance.last_error = Some(e.to_string());
                }
                Err(e) => {
                    tracing::error!("Workflow {} failed: {}", self.instance.id, e);
                    self.instance.last_error = Some(e.to_string());
                    break SchedulerExit::Finished(WorkflowState::Failed);
                }
            }
        };

        SchedulerReport {
            instance_id: self.instance.id,
            exit,
            lease: self.lease,
            last_error: self.instance.last_error,
        }
    }

    /// One pass of the loop body
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let now = self.ctx.clock.now();

        if self
            .lease
            .renewal_due(now, self.ctx.settings.lease_renew_interval)
        {
            self.ctx.leases.renew(&mut self.lease).await?;
        }

        if self.signal_poll_due(now) {
            self.last_signal_poll = Some(now);
            match self.ctx.signals.poll(self.instance.id).await {
                Ok(signals) => {
                    for signal in signals {
                        self.apply_signal(&signal, now).await?;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Signal poll for {} failed: {}", self.instance.id, e);
                }
                Err(e) => return Err(e),
            }
        }

        if self.latch.abort_requested() {
            return self.abort(now).await;
        }

        for task in self.graph.refresh_readiness(now) {
            self.persist_task(&task).await?;
        }

        if !self.latch.stop_requested() {
            self.dispatch_ready(now).await?;
        }

        match self.ctx.dispatcher.poll_completions(self.instance.id).await {
            Ok(events) => {
                for event in events {
                    self.apply_event(event, now).await?;
                }
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Completion poll for {} failed: {}", self.instance.id, e);
            }
            Err(e) => return Err(e),
        }
        self.expire_overdue(now).await?;

        if self.ctx.settings.forget_consumed_results {
            self.forget_consumed().await;
        }

        if self.latch.stop_requested() && !self.graph.any_in_flight() {
            return Ok(PollOutcome::Finished(WorkflowState::Stopped));
        }
        if self.graph.is_terminal() {
            return Ok(PollOutcome::Finished(self.graph.computed_outcome()));
        }

        Ok(PollOutcome::Continue)
    }

    fn signal_poll_due(&self, now: DateTime<Utc>) -> bool {
        self.last_signal_poll
            .map_or(true, |last| now - last >= self.ctx.settings.signal_interval)
    }

    async fn apply_signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Result<()> {
        match self.latch.apply(signal) {
            Some(SignalKind::Stop) => {
                tracing::info!("Stopping workflow {}", self.instance.id);
                self.set_state(WorkflowState::Stopping, now).await?;
            }
            Some(SignalKind::Abort) => {
                tracing::info!("Aborting workflow {}", self.instance.id);
                self.set_state(WorkflowState::Aborting, now).await?;
            }
            Some(SignalKind::Custom(name)) => {
                tracing::info!(
                    "Ignoring custom signal {} for workflow {} (task: {:?})",
                    name,
                    self.instance.id,
                    signal.task
                );
            }
            None => {
                tracing::debug!(
                    "Signal {} already applied to workflow {}",
                    signal.name,
                    self.instance.id
                );
            }
        }
        Ok(())
    }

    async fn abort(&mut self, now: DateTime<Utc>) -> Result<PollOutcome> {
        if self.instance.state != WorkflowState::Aborting {
            self.set_state(WorkflowState::Aborting, now).await?;
        }
        for task in self.graph.skip_all(now) {
            self.persist_task(&task).await?;
        }
        Ok(PollOutcome::Finished(WorkflowState::Aborted))
    }

    async fn dispatch_ready(&mut self, now: DateTime<Utc>) -> Result<()> {
        for task in self.graph.tasks_in_state(TaskState::Ready) {
            let Some(node) = self.graph.node(&task) else {
                continue;
            };
            let submission = TaskSubmission {
                instance_id: self.instance.id,
                task_id: task.clone(),
                name: node.spec.name.clone(),
                queue: node.spec.queue.clone(),
                payload: node.spec.payload.clone(),
                input: self.graph.input_for(&task, &self.instance.input)?,
                attempt: node.attempt + 1,
            };

            match self.ctx.dispatcher.submit(submission).await {
                Ok(handle) => {
                    tracing::debug!("Dispatched task {} of {} as {}", task, self.instance.id, handle);
                    self.graph.record_dispatch(&task, handle, now)?;
                    self.persist_task(&task).await?;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Dispatch of task {} deferred: {}", task, e);
                    break;
                }
                Err(e @ OrchestratorError::DispatchRejected { .. }) => {
                    self.fail_task(&task, e.to_string(), now).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn apply_event(&mut self, event: DispatchEvent, now: DateTime<Utc>) -> Result<()> {
        let Some(node) = self.graph.node(&event.task_id) else {
            tracing::warn!(
                "Report for unknown task {} of {}",
                event.task_id,
                self.instance.id
            );
            return Ok(());
        };

        if node.state.is_terminal() || node.dispatch_handle.as_ref() != Some(&event.handle) {
            tracing::debug!(
                "Discarding stale report for task {} ({})",
                event.task_id,
                node.state
            );
            return Ok(());
        }

        let task = event.task_id;
        match event.outcome {
            DispatchOutcome::Started => {
                if node.state == TaskState::Dispatched {
                    self.graph.transition(&task, TaskState::Running, now)?;
                    self.persist_task(&task).await?;
                }
            }
            DispatchOutcome::Completed { result, limit } => {
                self.graph.record_result(&task, result, now)?;
                self.persist_task(&task).await?;
                tracing::debug!("Task {} of {} completed", task, self.instance.id);

                if let Some(limit) = limit {
                    self.apply_limit(&task, &limit, now).await?;
                }
            }
            DispatchOutcome::Failed { error } => {
                self.fail_task(&task, error, now).await?;
            }
        }
        Ok(())
    }

    /// Skip successors a completed task did not select
    async fn apply_limit(&mut self, task: &TaskId, limit: &[TaskId], now: DateTime<Utc>) -> Result<()> {
        for successor in self.graph.successors(task)? {
            if limit.contains(&successor) {
                continue;
            }
            if self
                .graph
                .state(&successor)
                .map_or(true, |state| state.is_terminal())
            {
                continue;
            }

            tracing::debug!("Task {} not selected by {}, skipping", successor, task);
            self.graph.transition(&successor, TaskState::Skipped, now)?;
            self.persist_task(&successor).await?;
            for skipped in self.graph.skip_downstream(&successor, now)? {
                self.persist_task(&skipped).await?;
            }
        }
        Ok(())
    }

    async fn expire_overdue(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut in_flight = self.graph.tasks_in_state(TaskState::Dispatched);
        in_flight.extend(self.graph.tasks_in_state(TaskState::Running));

        for task in in_flight {
            let Some(node) = self.graph.node(&task) else {
                continue;
            };
            let Some(dispatched_at) = node.dispatched_at else {
                continue;
            };
            let timeout_secs = node
                .spec
                .timeout_secs
                .unwrap_or(self.ctx.settings.dispatch_timeout_secs);
            let limit_ms = i64::try_from(timeout_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1_000);

            if now.signed_duration_since(dispatched_at).num_milliseconds() > limit_ms {
                let error = OrchestratorError::DispatchTimeout {
                    task: task.clone(),
                    timeout_secs,
                };
                self.fail_task(&task, error.to_string(), now).await?;
            }
        }
        Ok(())
    }

    /// Fail a task and skip everything downstream of it
    async fn fail_task(&mut self, task: &TaskId, error: String, now: DateTime<Utc>) -> Result<()> {
        tracing::warn!("Task {} of {} failed: {}", task, self.instance.id, error);

        self.graph.record_failure(task, error.clone(), now)?;
        self.persist_task(task).await?;
        for skipped in self.graph.skip_downstream(task, now)? {
            self.persist_task(&skipped).await?;
        }

        self.instance.last_error = Some(format!("task {}: {}", task, error));
        self.instance.updated_at = now;
        self.ctx.records.put_instance(&self.instance).await
    }

    /// Release retained results every successor has already consumed
    async fn forget_consumed(&mut self) {
        for task in self.graph.tasks_in_state(TaskState::Completed) {
            if self.forgotten.contains(&task) {
                continue;
            }
            let consumed = match self.graph.successors(&task) {
                Ok(successors) => successors
                    .iter()
                    .all(|s| self.graph.state(s).is_some_and(|state| state.is_terminal())),
                Err(_) => false,
            };
            if !consumed {
                continue;
            }

            let Some(handle) = self.graph.node(&task).and_then(|n| n.dispatch_handle.clone()) else {
                continue;
            };
            match self.ctx.dispatcher.forget(&handle).await {
                Ok(()) => {
                    self.forgotten.insert(task);
                }
                Err(e) => tracing::warn!("Could not forget result of task {}: {}", task, e),
            }
        }
    }

    async fn persist_task(&self, task: &TaskId) -> Result<()> {
        let record = self.graph.to_record(self.instance.id, task)?;
        self.ctx.records.put_task(&record).await
    }

    async fn set_state(&mut self, state: WorkflowState, now: DateTime<Utc>) -> Result<()> {
        self.instance.state = state;
        self.instance.updated_at = now;
        self.ctx.records.put_instance(&self.instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatcher::ManualDispatcher;
    use crate::retry::RetryPolicy;
    use crate::signal::MemorySignalChannel;
    use crate::store::records::{definition_key, lease_key};
    use crate::store::MemoryStateStore;
    use crate::types::{DagDefinition, DispatchHandle, RunnerId, TaskSpec};
    use serde_json::json;

    struct Harness {
        clock: Arc<ManualClock>,
        dispatcher: Arc<ManualDispatcher>,
        signals: Arc<MemorySignalChannel>,
        ctx: SchedulerContext,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let dispatcher = Arc::new(ManualDispatcher::new());
            let signals = Arc::new(MemorySignalChannel::new());
            let records = InstanceStore::new(Arc::new(MemoryStateStore::new()), RetryPolicy::none());
            let leases = LeaseManager::new(records.clone(), clock.clone(), Duration::seconds(30));

            let ctx = SchedulerContext {
                records,
                leases,
                signals: signals.clone(),
                dispatcher: dispatcher.clone(),
                clock: clock.clone(),
                settings: SchedulerSettings {
                    poll_interval: std::time::Duration::from_millis(10),
                    signal_interval: Duration::zero(),
                    lease_renew_interval: Duration::seconds(10),
                    dispatch_timeout_secs: 3_600,
                    forget_consumed_results: true,
                },
            };

            Self {
                clock,
                dispatcher,
                signals,
                ctx,
            }
        }

        async fn start(&self, tasks: Vec<TaskSpec>) -> DagScheduler {
            let id = InstanceId::new();
            let now = self.clock.now();
            let definition = DagDefinition {
                name: "test".to_string(),
                tasks,
            };
            self.ctx.records.put_definition(id, &definition).await.unwrap();
            self.ctx
                .records
                .put_instance(&WorkflowInstance {
                    id,
                    name: "test".to_string(),
                    definition_ref: definition_key(id),
                    state: WorkflowState::Created,
                    input: json!({"seed": true}),
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();

            let lease = self
                .ctx
                .leases
                .acquire(id, &RunnerId::new("test-runner"))
                .await
                .unwrap();
            DagScheduler::load(self.ctx.clone(), id, lease).await.unwrap()
        }

        async fn stored_state(&self, id: InstanceId) -> WorkflowState {
            self.ctx.records.load_instance(id).await.unwrap().state
        }
    }

    fn state(scheduler: &DagScheduler, task: &str) -> TaskState {
        scheduler.graph().state(&TaskId::new(task)).unwrap()
    }

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|s| TaskId::new(*s)).collect()
    }

    #[tokio::test]
    async fn test_linear_chain_completes() {
        let h = Harness::new();
        let mut s = h
            .start(vec![
                TaskSpec::new("a"),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c").after(["b"]),
            ])
            .await;
        let id = s.instance_id();
        assert_eq!(h.stored_state(id).await, WorkflowState::Running);

        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        for task in ["a", "b"] {
            assert_eq!(state(&s, task), TaskState::Dispatched);
            assert!(h.dispatcher.ack(id, task));
            assert!(h.dispatcher.complete(id, task, json!(task)));

            // absorb the report, then dispatch the successor
            assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
            assert_eq!(state(&s, task), TaskState::Completed);
            assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        }

        assert!(h.dispatcher.complete(id, "c", json!("c")));
        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Completed)
        );
        assert_eq!(h.dispatcher.submitted(id), ids(&["a", "b", "c"]));

        let inputs: Vec<_> = h.dispatcher.submissions().into_iter().map(|s| s.input).collect();
        assert_eq!(inputs[0], json!({"seed": true}));
        assert_eq!(inputs[2], json!({"b": "b"}));
    }

    #[tokio::test]
    async fn test_failure_skips_diamond_downstream() {
        let h = Harness::new();
        let mut s = h
            .start(vec![
                TaskSpec::new("a"),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c").after(["a"]),
                TaskSpec::new("d").after(["b", "c"]),
            ])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.fail(id, "a", "exit 1");

        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Failed)
        );
        assert_eq!(state(&s, "a"), TaskState::Failed);
        for task in ["b", "c", "d"] {
            assert_eq!(state(&s, task), TaskState::Skipped);
        }
        assert_eq!(h.dispatcher.submitted(id), ids(&["a"]));
        assert!(s.instance().last_error.as_deref().unwrap().contains("exit 1"));

        let stored = h.ctx.records.load_tasks(id).await.unwrap();
        assert!(stored
            .iter()
            .filter(|r| r.id.as_str() != "a")
            .all(|r| r.state == TaskState::Skipped));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_fails_only_its_branch() {
        let h = Harness::new();
        let mut s = h
            .start(vec![
                TaskSpec::new("x").with_timeout_secs(60),
                TaskSpec::new("y"),
                TaskSpec::new("z").after(["x"]),
            ])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.ack(id, "x");
        h.dispatcher.complete(id, "y", json!(1));
        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);

        h.clock.advance(Duration::seconds(61));
        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Failed)
        );
        assert_eq!(state(&s, "x"), TaskState::Failed);
        assert_eq!(state(&s, "y"), TaskState::Completed);
        assert_eq!(state(&s, "z"), TaskState::Skipped);

        let error = s.graph().node(&TaskId::new("x")).unwrap().error.clone().unwrap();
        assert!(error.contains("dispatch deadline"));
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_finish() {
        let h = Harness::new();
        let mut s = h
            .start(vec![
                TaskSpec::new("a"),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c"),
            ])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.signals.publish(Signal::stop(id, h.clock.now())).await.unwrap();
        h.signals.publish(Signal::stop(id, h.clock.now())).await.unwrap();
        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        assert_eq!(h.stored_state(id).await, WorkflowState::Stopping);

        h.dispatcher.complete(id, "a", json!(1));
        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        assert_eq!(state(&s, "a"), TaskState::Completed);

        h.dispatcher.complete(id, "c", json!(2));
        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Stopped)
        );
        assert_eq!(state(&s, "b"), TaskState::Ready);
        assert_eq!(h.dispatcher.submitted(id), ids(&["a", "c"]));
    }

    #[tokio::test]
    async fn test_abort_skips_without_waiting() {
        let h = Harness::new();
        let mut s = h
            .start(vec![TaskSpec::new("a"), TaskSpec::new("b").after(["a"])])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.ack(id, "a");
        h.signals.publish(Signal::abort(id, h.clock.now())).await.unwrap();

        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Aborted)
        );
        assert_eq!(state(&s, "a"), TaskState::Skipped);
        assert_eq!(state(&s, "b"), TaskState::Skipped);
        assert_eq!(h.stored_state(id).await, WorkflowState::Aborting);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_reports_are_ignored() {
        let h = Harness::new();
        let mut s = h.start(vec![TaskSpec::new("a"), TaskSpec::new("b")]).await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.deliver(
            id,
            DispatchEvent {
                handle: DispatchHandle::generate(),
                task_id: TaskId::new("a"),
                outcome: DispatchOutcome::Failed {
                    error: "from an old attempt".to_string(),
                },
            },
        );
        h.dispatcher.complete(id, "b", json!(1));
        h.dispatcher.fail(id, "b", "late duplicate");

        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        assert_eq!(state(&s, "a"), TaskState::Dispatched);
        assert_eq!(state(&s, "b"), TaskState::Completed);
    }

    #[tokio::test]
    async fn test_result_limit_skips_unselected_successors() {
        let h = Harness::new();
        let mut s = h
            .start(vec![
                TaskSpec::new("a"),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c").after(["a"]),
                TaskSpec::new("d").after(["c"]),
            ])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.complete_with_limit(id, "a", json!("branch"), &["b"]);
        s.poll_once().await.unwrap();
        assert_eq!(state(&s, "c"), TaskState::Skipped);
        assert_eq!(state(&s, "d"), TaskState::Skipped);

        s.poll_once().await.unwrap();
        assert_eq!(state(&s, "b"), TaskState::Dispatched);
        h.dispatcher.complete(id, "b", json!(1));

        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Completed)
        );
        let a_handle = h.dispatcher.handle_of(id, "a").unwrap();
        assert!(h.dispatcher.forgotten().contains(&a_handle));
    }

    #[tokio::test]
    async fn test_transient_dispatch_failure_keeps_task_ready() {
        let h = Harness::new();
        let mut s = h.start(vec![TaskSpec::new("a")]).await;
        let id = s.instance_id();

        h.dispatcher.set_unavailable(true);
        assert_eq!(s.poll_once().await.unwrap(), PollOutcome::Continue);
        assert_eq!(state(&s, "a"), TaskState::Ready);

        h.dispatcher.set_unavailable(false);
        s.poll_once().await.unwrap();
        assert_eq!(state(&s, "a"), TaskState::Dispatched);
        assert_eq!(h.dispatcher.submitted(id), ids(&["a"]));
    }

    #[tokio::test]
    async fn test_rejected_dispatch_fails_task() {
        let h = Harness::new();
        let mut s = h
            .start(vec![TaskSpec::new("a"), TaskSpec::new("b").after(["a"])])
            .await;

        h.dispatcher.reject("a");
        assert_eq!(
            s.poll_once().await.unwrap(),
            PollOutcome::Finished(WorkflowState::Failed)
        );
        assert_eq!(state(&s, "b"), TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_takeover_surfaces_lease_lost() {
        let h = Harness::new();
        let mut s = h.start(vec![TaskSpec::new("a")]).await;
        let id = s.instance_id();

        h.ctx
            .records
            .raw()
            .write(
                &lease_key(id),
                json!({
                    "holder": "other",
                    "acquired_at": h.clock.now(),
                    "expires_at": h.clock.now() + Duration::seconds(30),
                }),
            )
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(11));

        let err = s.poll_once().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaseLost(lost) if lost == id));
    }

    #[tokio::test]
    async fn test_resume_restores_persisted_progress() {
        let h = Harness::new();
        let mut s = h
            .start(vec![TaskSpec::new("a"), TaskSpec::new("b").after(["a"])])
            .await;
        let id = s.instance_id();

        s.poll_once().await.unwrap();
        h.dispatcher.complete(id, "a", json!(1));
        s.poll_once().await.unwrap();
        s.poll_once().await.unwrap();

        let report = s.run(cancelled()).await;
        assert_eq!(report.exit, SchedulerExit::Cancelled);

        let resumed = DagScheduler::load(h.ctx.clone(), id, report.lease).await.unwrap();
        assert_eq!(state(&resumed, "a"), TaskState::Completed);
        assert_eq!(state(&resumed, "b"), TaskState::Dispatched);
        assert_eq!(h.dispatcher.submitted(id), ids(&["a", "b"]));
    }

    fn cancelled() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }
}
