//! [`Executor`] – the pipeline engine.
//!
//! The executor is the queue's single consumer.  Once started it listens for
//! the queue's work signal (and re-checks on a fixed interval), and every
//! wake-up triggers a **drain**: dequeue one task, push it through every
//! pipeline stage, repeat until the queue is empty.
//!
//! For each stage, in declared order:
//!
//! 1. **Resolve** – look the stage's service up in the
//!    [`ServiceRegistry`][foreman_kernel::ServiceRegistry].  A missing service
//!    yields a [`StageOutcome::Skipped`] and the pipeline moves on.
//! 2. **Gatekeep** – a privileged stage must pass the
//!    [`PermissionGate`][foreman_kernel::PermissionGate].  Any refusal fails
//!    the task at this stage.
//! 3. **Act** – call [`Service::execute`].  Errors, panics, and timeouts fail
//!    the task at this stage.
//!
//! A failed task is not retried; the drain moves on to the next one.
//!
//! # One drain at a time
//!
//! A drain first takes the queue's [`DrainClaim`][crate::queue::DrainClaim],
//! so at most one drain loop runs at any moment, no matter how many
//! wake-ups, [`Executor::drain`] calls, or executors sharing the same
//! [`OrchestrationContext`] race.  Tasks are
//! therefore processed strictly one after another in FIFO order, and a task
//! stalled on an approval holds up the tasks behind it.
//!
//! # Stopping
//!
//! [`Executor::stop`] is cooperative: a drain already running finishes its
//! current task but does not dequeue another.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use foreman_kernel::{Service, StageRequest};
use foreman_middleware::Topic;
use foreman_types::{EventPayload, ServiceError, StageOutcome, StageResult, Task, TaskStatus};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::OrchestrationContext;
use crate::pipeline::{Pipeline, PipelineStage};
use crate::queue::WorkSignal;

const SOURCE: &str = "foreman-runtime::executor";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identity presented to the permission gate for privileged stages.
    pub agent_name: String,
    /// Period of the fallback queue re-check (and approval sweep).
    pub recheck_interval: Duration,
    /// Upper bound on a single stage's service call.  `None` waits forever.
    pub stage_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_name: "executor".to_string(),
            recheck_interval: Duration::from_secs(5),
            stage_timeout: None,
        }
    }
}

/// What a call to [`Executor::drain`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Ran a drain that processed this many tasks.
    Drained(usize),
    /// Another drain was already running; nothing was done.
    AlreadyDraining,
    /// The executor is stopped; nothing was done.
    Inactive,
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

struct Listener {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Drives queued tasks through the [`Pipeline`].
pub struct Executor {
    ctx: Arc<OrchestrationContext>,
    pipeline: Pipeline,
    config: ExecutorConfig,
    active: AtomicBool,
    /// Held by the listener for as long as it runs.
    signal: tokio::sync::Mutex<Option<WorkSignal>>,
    listener: Mutex<Listener>,
}

impl Executor {
    /// Build an executor over `ctx`, claiming the queue's work signal.
    ///
    /// If the signal was already claimed the executor still works, but only
    /// notices new tasks on its periodic re-check.  Executors sharing a
    /// context never drain concurrently.
    pub fn new(ctx: Arc<OrchestrationContext>, pipeline: Pipeline, config: ExecutorConfig) -> Self {
        let signal = ctx.queue.take_signal();
        if signal.is_none() {
            warn!("work signal already claimed; executor will rely on periodic re-checks");
        }
        Self {
            ctx,
            pipeline,
            config,
            active: AtomicBool::new(false),
            signal: tokio::sync::Mutex::new(signal),
            listener: Mutex::new(Listener {
                shutdown: None,
                handle: None,
            }),
        }
    }

    pub fn context(&self) -> &Arc<OrchestrationContext> {
        &self.ctx
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether any drain of this executor's queue is running.
    pub fn is_draining(&self) -> bool {
        self.ctx.queue.is_draining()
    }

    /// Start listening for work.  Must be called from within a Tokio runtime.
    ///
    /// Returns `false` (and logs a warning) when already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.active.swap(true, Ordering::AcqRel) {
            warn!("executor already started; ignoring");
            return false;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(self).listen(shutdown_rx));

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        listener.shutdown = Some(shutdown_tx);
        listener.handle = Some(handle);
        info!(stages = self.pipeline.len(), agent = %self.config.agent_name, "executor started");
        true
    }

    /// Mark the executor inactive.  A running drain finishes its current
    /// task and then stops dequeuing.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            warn!("executor already stopped; ignoring");
            return;
        }
        let shutdown = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        info!(pending = self.ctx.queue.size(), "executor stopping");
    }

    /// [`stop`][Self::stop], then wait for the listener (and any in-flight
    /// task) to finish.
    pub async fn shutdown(&self) {
        if self.is_active() {
            self.stop();
        }
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "executor listener ended abnormally");
            }
        }
    }

    /// Drain the queue now, unless the executor is stopped or another drain
    /// is already running.
    pub async fn drain(&self) -> DrainOutcome {
        let mut processed = 0;
        loop {
            if !self.is_active() {
                return if processed == 0 {
                    DrainOutcome::Inactive
                } else {
                    DrainOutcome::Drained(processed)
                };
            }
            let Some(claim) = self.ctx.queue.try_claim_drain() else {
                debug!("drain already in progress");
                return if processed == 0 {
                    DrainOutcome::AlreadyDraining
                } else {
                    DrainOutcome::Drained(processed)
                };
            };

            while self.is_active() {
                let Some(task) = self.ctx.queue.dequeue() else {
                    break;
                };
                self.process(task).await;
                processed += 1;
            }
            drop(claim);

            // Work that arrived while the claim was still held would otherwise
            // wait for the next re-check.
            if !self.is_active() || self.ctx.queue.is_empty() {
                return DrainOutcome::Drained(processed);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Listener
    // -------------------------------------------------------------------------

    async fn listen(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut signal = self.signal.lock().await;
        let mut recheck = tokio::time::interval(self.config.recheck_interval);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                woke = wait_for_work(signal.as_mut()) => {
                    if !woke {
                        *signal = None;
                        continue;
                    }
                    self.drain().await;
                }
                _ = recheck.tick() => {
                    let expired = self.ctx.approvals().sweep_expired();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "swept expired approval requests");
                    }
                    self.drain().await;
                }
            }
        }
        debug!("executor listener exited");
    }

    // -------------------------------------------------------------------------
    // Task processing
    // -------------------------------------------------------------------------

    async fn process(&self, mut task: Task) {
        info!(task_id = %task.id, feature = %task.feature_name, "task started");

        for stage in self.pipeline.stages() {
            task.status = TaskStatus::InProgress {
                stage: stage.name.clone(),
            };

            let Some(service) = self.ctx.registry.get(&stage.service) else {
                warn!(
                    task_id = %task.id,
                    stage = %stage.name,
                    service = %stage.service,
                    "service not registered; skipping stage"
                );
                task.record(StageResult::new(
                    &stage.name,
                    &stage.service,
                    StageOutcome::Skipped {
                        reason: format!("service '{}' is not registered", stage.service),
                    },
                ));
                self.emit(EventPayload::StageSkipped {
                    task_id: task.id.clone(),
                    stage: stage.name.clone(),
                    service: stage.service.clone(),
                });
                continue;
            };

            if let Some(privilege) = &stage.privilege {
                let justification = format!(
                    "{} stage of task {} ({})",
                    stage.name, task.id, task.feature_name
                );
                if let Err(e) = self
                    .ctx
                    .gate
                    .authorize(
                        &privilege.action,
                        &privilege.resource,
                        &justification,
                        &self.config.agent_name,
                    )
                    .await
                {
                    self.fail(&mut task, stage, e.to_string());
                    return;
                }
            }

            let request = StageRequest {
                task_id: task.id.clone(),
                feature_name: task.feature_name.clone(),
                stage: stage.name.clone(),
                service: stage.service.clone(),
                prior: task.stages.clone(),
            };
            match self.invoke(service.as_ref(), &request).await {
                Ok(output) => {
                    debug!(task_id = %task.id, stage = %stage.name, %output, "stage completed");
                    task.record(StageResult::new(
                        &stage.name,
                        &stage.service,
                        StageOutcome::Completed { output },
                    ));
                    self.emit(EventPayload::StageCompleted {
                        task_id: task.id.clone(),
                        stage: stage.name.clone(),
                        service: stage.service.clone(),
                    });
                }
                Err(reason) => {
                    self.fail(&mut task, stage, reason);
                    return;
                }
            }
        }

        task.status = TaskStatus::Completed;
        let stages = task.completed_stages();
        info!(task_id = %task.id, stages = ?stages, "task completed");
        self.emit(EventPayload::TaskCompleted {
            task_id: task.id.clone(),
            stages,
        });
    }

    /// Call the service, turning errors, panics, and timeouts into a reason.
    async fn invoke(&self, service: &dyn Service, request: &StageRequest) -> Result<String, String> {
        let call = AssertUnwindSafe(service.execute(request)).catch_unwind();
        let result = match self.config.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(ServiceError::TimedOut(limit).to_string()),
            },
            None => call.await,
        };
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("stage panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    fn fail(&self, task: &mut Task, stage: &PipelineStage, reason: String) {
        warn!(task_id = %task.id, stage = %stage.name, %reason, "task failed");
        task.record(StageResult::new(
            &stage.name,
            &stage.service,
            StageOutcome::Failed {
                error: reason.clone(),
            },
        ));
        task.status = TaskStatus::Failed {
            stage: stage.name.clone(),
            reason: reason.clone(),
        };
        self.emit(EventPayload::StageFailed {
            task_id: task.id.clone(),
            stage: stage.name.clone(),
            error: reason.clone(),
        });
        self.emit(EventPayload::TaskFailed {
            task_id: task.id.clone(),
            stage: stage.name.clone(),
            reason,
        });
    }

    fn emit(&self, payload: EventPayload) {
        self.ctx.bus.emit(Topic::Tasks, SOURCE, payload);
    }
}

async fn wait_for_work(signal: Option<&mut WorkSignal>) -> bool {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use foreman_kernel::{FnService, GateConfig, RolePolicy};
    use foreman_middleware::TopicReceiver;
    use foreman_types::{Event, PermissionCheckResult};

    use crate::pipeline::{DEPLOYMENT_AGENT, DEVELOPER_AGENT, QA_AGENT, TESTER_AGENT};

    fn deploy_policy() -> RolePolicy {
        let mut policy = RolePolicy::new();
        policy.grant("executor", "DEPLOY");
        policy.require_approval("DEPLOY", "prod");
        policy
    }

    fn context(policy: RolePolicy) -> Arc<OrchestrationContext> {
        Arc::new(OrchestrationContext::new(Arc::new(policy), GateConfig::default()))
    }

    fn executor(ctx: &Arc<OrchestrationContext>, pipeline: Pipeline) -> Arc<Executor> {
        Arc::new(Executor::new(Arc::clone(ctx), pipeline, ExecutorConfig::default()))
    }

    fn register_noop(ctx: &OrchestrationContext, name: &str) {
        ctx.registry
            .register(name, Arc::new(FnService::noop(name)))
            .unwrap();
    }

    /// Longer than an approval TTL so paused-clock tests can run to expiry.
    const OUTCOME_WAIT: Duration = Duration::from_secs(3 * 3600);

    /// Wait for the next terminal task event (completed or failed).
    async fn next_outcome(rx: &mut TopicReceiver) -> Event {
        loop {
            let event = tokio::time::timeout(OUTCOME_WAIT, rx.recv())
                .await
                .expect("timed out waiting for task outcome")
                .expect("bus closed");
            if matches!(
                event.payload,
                EventPayload::TaskCompleted { .. } | EventPayload::TaskFailed { .. }
            ) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn scenario_two_stage_services_complete_task() {
        let ctx = context(deploy_policy());
        register_noop(&ctx, DEVELOPER_AGENT);
        register_noop(&ctx, TESTER_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);

        ctx.queue.enqueue(Task::new("t1", "X"));
        let exec = executor(&ctx, Pipeline::standard());
        assert!(exec.start());

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskCompleted { task_id, stages } => {
                assert_eq!(task_id, "t1");
                assert_eq!(stages, vec!["implement", "verify"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctx.queue.size(), 0);
        // Missing qa/deployment agents were skipped, so no approval was filed.
        assert!(ctx.approvals().list_pending().is_empty());
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn skip_events_are_published_in_stage_order() {
        let ctx = context(deploy_policy());
        register_noop(&ctx, TESTER_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        ctx.queue.enqueue(Task::new("t1", "X"));
        let mut trail = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::StageSkipped { stage, .. } => trail.push(format!("skip:{stage}")),
                EventPayload::StageCompleted { stage, .. } => trail.push(format!("done:{stage}")),
                EventPayload::TaskCompleted { .. } => break,
                _ => {}
            }
        }
        assert_eq!(
            trail,
            vec!["skip:implement", "done:verify", "skip:review", "skip:finalize"]
        );
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let ctx = context(deploy_policy());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        ctx.registry
            .register(
                DEVELOPER_AGENT,
                Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(move |req| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(req.task_id.clone());
                        Ok(String::new())
                    }
                })),
            )
            .unwrap();

        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);

        for i in 0..10 {
            ctx.queue.enqueue(Task::new(format!("t{i}"), "X"));
        }
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();
        for _ in 0..10 {
            next_outcome(&mut rx).await;
        }
        exec.shutdown().await;

        let expected: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_drain_runs_at_a_time() {
        let ctx = context(deploy_policy());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            ctx.registry
                .register(
                    DEVELOPER_AGENT,
                    Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(move |_| {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(String::new())
                        }
                    })),
                )
                .unwrap();
        }
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        let triggers: Vec<_> = (0..8)
            .map(|i| {
                let exec = Arc::clone(&exec);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    ctx.queue.enqueue(Task::new(format!("t{i}"), "X"));
                    exec.drain().await
                })
            })
            .collect();
        let mut outcomes = Vec::new();
        for t in triggers {
            outcomes.push(t.await.unwrap());
        }

        let mut completed = 0;
        while completed < 8 {
            if matches!(next_outcome(&mut rx).await.payload, EventPayload::TaskCompleted { .. }) {
                completed += 1;
            }
        }
        exec.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "two tasks were processed concurrently");
        assert!(outcomes.iter().all(|o| !matches!(o, DrainOutcome::Inactive)));
        assert_eq!(ctx.queue.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn executors_sharing_a_context_never_drain_concurrently() {
        let ctx = context(deploy_policy());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            ctx.registry
                .register(
                    DEVELOPER_AGENT,
                    Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(move |_| {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(String::new())
                        }
                    })),
                )
                .unwrap();
        }
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        let first = executor(&ctx, Pipeline::standard());
        let second = executor(&ctx, Pipeline::standard());
        first.start();
        second.start();

        for i in 0..6 {
            ctx.queue.enqueue(Task::new(format!("t{i}"), "X"));
        }
        let triggers: Vec<_> = (0..8)
            .map(|i| {
                let exec = Arc::clone(if i % 2 == 0 { &first } else { &second });
                tokio::spawn(async move { exec.drain().await })
            })
            .collect();
        for t in triggers {
            t.await.unwrap();
        }

        let mut completed = 0;
        while completed < 6 {
            if matches!(next_outcome(&mut rx).await.payload, EventPayload::TaskCompleted { .. }) {
                completed += 1;
            }
        }
        first.shutdown().await;
        second.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "two executors processed tasks concurrently");
        assert_eq!(ctx.queue.size(), 0);
        assert!(!ctx.queue.is_draining());
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let ctx = context(deploy_policy());
        let exec = executor(&ctx, Pipeline::standard());
        assert!(exec.start());
        assert!(!exec.start());
        assert!(exec.is_active());
        exec.shutdown().await;
        assert!(!exec.is_active());
        // Stopping again only warns.
        exec.stop();
    }

    #[tokio::test]
    async fn drain_on_stopped_executor_does_nothing() {
        let ctx = context(deploy_policy());
        register_noop(&ctx, DEVELOPER_AGENT);
        ctx.queue.enqueue(Task::new("t1", "X"));
        let exec = executor(&ctx, Pipeline::standard());
        assert_eq!(exec.drain().await, DrainOutcome::Inactive);
        assert_eq!(ctx.queue.size(), 1);
    }

    #[tokio::test]
    async fn stop_lets_current_task_finish_but_starts_no_new_one() {
        let ctx = context(deploy_policy());
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        ctx.registry
            .register(
                DEVELOPER_AGENT,
                Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(move |_| {
                    let entered_tx = Arc::clone(&entered_tx);
                    let release_rx = Arc::clone(&release_rx);
                    async move {
                        if let Some(tx) = entered_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        if let Some(rx) = release_rx.lock().await.take() {
                            let _ = rx.await;
                        }
                        Ok(String::new())
                    }
                })),
            )
            .unwrap();
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);

        for i in 0..3 {
            ctx.queue.enqueue(Task::new(format!("t{i}"), "X"));
        }
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();
        entered_rx.await.unwrap();

        exec.stop();
        release_tx.send(()).unwrap();
        exec.shutdown().await;

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskCompleted { task_id, .. } => assert_eq!(task_id, "t0"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctx.queue.size(), 2);
        assert_eq!(ctx.queue.snapshot()[0].id, "t1");
    }

    #[tokio::test]
    async fn restart_resumes_draining() {
        let ctx = context(deploy_policy());
        register_noop(&ctx, DEVELOPER_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        let exec = executor(&ctx, Pipeline::standard());

        exec.start();
        exec.shutdown().await;
        ctx.queue.enqueue(Task::new("t1", "X"));
        assert!(exec.start());

        assert!(matches!(
            next_outcome(&mut rx).await.payload,
            EventPayload::TaskCompleted { ref task_id, .. } if task_id == "t1"
        ));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn service_error_fails_task_and_next_task_proceeds() {
        let ctx = context(deploy_policy());
        ctx.registry
            .register(
                DEVELOPER_AGENT,
                Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(|req| async move {
                    if req.task_id == "bad" {
                        Err(ServiceError::Failed("compile error".into()))
                    } else {
                        Ok("built".into())
                    }
                })),
            )
            .unwrap();
        let tester_runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&tester_runs);
            ctx.registry
                .register(
                    TESTER_AGENT,
                    Arc::new(FnService::noop(TESTER_AGENT).on_execute(move |_| {
                        let runs = Arc::clone(&runs);
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok("green".into())
                        }
                    })),
                )
                .unwrap();
        }
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        ctx.queue.enqueue(Task::new("bad", "X"));
        ctx.queue.enqueue(Task::new("good", "Y"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskFailed { task_id, stage, reason } => {
                assert_eq!(task_id, "bad");
                assert_eq!(stage, "implement");
                assert!(reason.contains("compile error"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            next_outcome(&mut rx).await.payload,
            EventPayload::TaskCompleted { ref task_id, .. } if task_id == "good"
        ));
        // The failed task never reached the verify stage.
        assert_eq!(tester_runs.load(Ordering::SeqCst), 1);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_stage_does_not_kill_the_drain() {
        let ctx = context(deploy_policy());
        ctx.registry
            .register(
                DEVELOPER_AGENT,
                Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(|req| async move {
                    if req.task_id == "boom" {
                        panic!("agent crashed");
                    }
                    Ok(String::new())
                })),
            )
            .unwrap();
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        ctx.queue.enqueue(Task::new("boom", "X"));
        ctx.queue.enqueue(Task::new("fine", "Y"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskFailed { reason, .. } => assert!(reason.contains("agent crashed")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            next_outcome(&mut rx).await.payload,
            EventPayload::TaskCompleted { .. }
        ));
        exec.shutdown().await;
        assert!(!exec.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stage_times_out() {
        let ctx = context(deploy_policy());
        ctx.registry
            .register(
                DEVELOPER_AGENT,
                Arc::new(FnService::noop(DEVELOPER_AGENT).on_execute(|_| async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(String::new())
                })),
            )
            .unwrap();
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        let config = ExecutorConfig {
            stage_timeout: Some(Duration::from_secs(30)),
            ..ExecutorConfig::default()
        };
        let exec = Arc::new(Executor::new(Arc::clone(&ctx), Pipeline::standard(), config));
        exec.start();
        ctx.queue.enqueue(Task::new("t1", "X"));

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskFailed { stage, reason, .. } => {
                assert_eq!(stage, "implement");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn denied_privileged_stage_fails_task() {
        // Executor identity holds no DEPLOY grant.
        let ctx = context(RolePolicy::new());
        register_noop(&ctx, DEPLOYMENT_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        ctx.queue.enqueue(Task::new("t1", "X"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskFailed { stage, reason, .. } => {
                assert_eq!(stage, "finalize");
                assert!(reason.contains("permission denied"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(ctx.approvals().list_pending().is_empty());
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn allowed_privileged_stage_runs_without_approval() {
        let policy = |_: &str, _: &str, _: &str| PermissionCheckResult::Allowed;
        let ctx = Arc::new(OrchestrationContext::new(Arc::new(policy), GateConfig::default()));
        register_noop(&ctx, DEPLOYMENT_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        ctx.queue.enqueue(Task::new("t1", "X"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        match next_outcome(&mut rx).await.payload {
            EventPayload::TaskCompleted { stages, .. } => assert_eq!(stages, vec!["finalize"]),
            other => panic!("unexpected outcome: {other:?}"),
        }
        exec.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn approved_deployment_completes_task() {
        let ctx = context(deploy_policy());
        for name in [DEVELOPER_AGENT, TESTER_AGENT, QA_AGENT, DEPLOYMENT_AGENT] {
            register_noop(&ctx, name);
        }
        let mut tasks = ctx.bus.subscribe_to(Topic::Tasks);
        let mut approvals = ctx.bus.subscribe_to(Topic::Approvals);
        ctx.queue.enqueue(Task::new("t1", "X"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        let request = loop {
            if let EventPayload::ApprovalRequested(req) = approvals.recv().await.unwrap().payload {
                break req;
            }
        };
        assert_eq!(request.action, "DEPLOY");
        assert_eq!(request.agent_name, "executor");
        assert!(request.justification.contains("t1"));
        ctx.approvals().approve(request.id, "oncall").unwrap();

        match next_outcome(&mut tasks).await.payload {
            EventPayload::TaskCompleted { stages, .. } => {
                assert_eq!(stages, vec!["implement", "verify", "review", "finalize"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        exec.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_approval_fails_task_at_finalize() {
        let ctx = context(deploy_policy());
        register_noop(&ctx, DEPLOYMENT_AGENT);
        let mut rx = ctx.bus.subscribe_to(Topic::Tasks);
        ctx.queue.enqueue(Task::new("t1", "X"));
        ctx.queue.enqueue(Task::new("t2", "Y"));
        let exec = executor(&ctx, Pipeline::standard());
        exec.start();

        for expected in ["t1", "t2"] {
            match next_outcome(&mut rx).await.payload {
                EventPayload::TaskFailed { task_id, stage, reason } => {
                    assert_eq!(task_id, expected);
                    assert_eq!(stage, "finalize");
                    assert!(reason.contains("expired"));
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        exec.shutdown().await;
    }
}
