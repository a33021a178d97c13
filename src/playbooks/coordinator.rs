//! Execution coordinator: one logical actor per execution.
//!
//! The coordinator owns every state transition of its execution. Steps run on pooled
//! workers and report back through a [`JoinSet`]; the coordinator applies each result
//! in arrival order, stamps a sequence number, persists it and re-evaluates readiness.
//! It never waits on one particular step.

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::TemplateContext;
use super::events::{EventBus, ExecutionEvent};
use super::graph::{self, DependencyGraph};
use super::runner::{StepRunner, StepScope};
use crate::error::{AppError, Result};
use crate::metrics::{
    ERRORS_TOTAL, EXECUTIONS_ACTIVE, EXECUTIONS_TOTAL, EXECUTION_DURATION_SECONDS,
    STEP_ATTEMPTS, STEP_DURATION_SECONDS, STEP_RESULTS_TOTAL, STORE_RETRIES_TOTAL,
};
use crate::models::{
    ExecutionFailure, ExecutionStatus, Playbook, PlaybookExecution, StepError, StepErrorKind,
    StepId, StepResult, StepStatus,
};
use crate::state::{ExecutionStore, StatusUpdate, StoreError, StoreResult};

/// Backoff applied to store writes while the backend is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl StoreRetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run a store operation, retrying `Unavailable` failures with backoff
pub async fn with_store_retry<T, F, Fut>(
    policy: &StoreRetryPolicy,
    operation: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Store unavailable, retrying"
                );
                STORE_RETRIES_TOTAL.with_label_values(&[operation]).inc();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Immutable coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Steps of one execution allowed in flight at once
    pub max_parallel_steps: usize,

    pub wall_clock_enabled: bool,

    /// Fixed wall-clock budget; derived from the playbook's worst case when unset
    pub wall_clock_timeout: Option<Duration>,

    pub store_retry: StoreRetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 8,
            wall_clock_enabled: true,
            wall_clock_timeout: None,
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    WallClock(Duration),
}

/// Drives executions to a terminal state
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn ExecutionStore>,
    runner: StepRunner,
    /// Shared across every execution; bounds concurrent handler invocations
    workers: Arc<Semaphore>,
    events: EventBus,
    config: Arc<CoordinatorConfig>,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        runner: StepRunner,
        worker_pool_size: usize,
        events: EventBus,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            runner,
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            events,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn runner(&self) -> &StepRunner {
        &self.runner
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Wall-clock budget for `playbook`, if enforced.
    ///
    /// The playbook's own budget wins over the configured one; without either the
    /// worst case of every step exhausting its retries is used.
    pub fn wall_clock_limit(&self, playbook: &Playbook) -> Option<Duration> {
        if !self.config.wall_clock_enabled {
            return None;
        }
        Some(
            playbook
                .wall_clock_timeout
                .or(self.config.wall_clock_timeout)
                .unwrap_or_else(|| self.runner.policy().worst_case_duration(playbook)),
        )
    }

    /// Drive `execution` until it is terminal.
    ///
    /// `cancel` is the operator cancellation signal. Every change to the execution is
    /// published on `snapshots`. Pending executions are started; running ones (after a
    /// restart) keep their recorded results and continue with the remaining steps.
    /// Only store exhaustion, violated invariants and a panicking driver surface as
    /// `Err`; in that case the execution is marked failed with an infrastructure reason
    /// where possible.
    pub async fn run(
        &self,
        playbook: Arc<Playbook>,
        execution: PlaybookExecution,
        cancel: CancellationToken,
        snapshots: &watch::Sender<PlaybookExecution>,
    ) -> Result<PlaybookExecution> {
        EXECUTIONS_ACTIVE.inc();

        let mut run = ExecutionRun::new(self, playbook, execution, snapshots);
        let outcome = match run.prepare() {
            Ok(graph) => AssertUnwindSafe(run.drive(graph, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(AppError::Internal("execution driver panicked".to_string()))
                }),
            Err(err) => Err(err),
        };

        EXECUTIONS_ACTIVE.dec();

        match outcome {
            Ok(()) => Ok(run.execution),
            Err(err) => {
                run.fail_infrastructure(&err).await;
                Err(err)
            }
        }
    }
}

/// State owned by the coordinator for the lifetime of one execution
struct ExecutionRun<'a> {
    coordinator: &'a ExecutionCoordinator,
    playbook: Arc<Playbook>,
    execution: PlaybookExecution,
    scope: StepScope,
    templates: TemplateContext,
    running: BTreeSet<StepId>,
    sequence: u64,
    snapshots: &'a watch::Sender<PlaybookExecution>,
}

impl<'a> ExecutionRun<'a> {
    fn new(
        coordinator: &'a ExecutionCoordinator,
        playbook: Arc<Playbook>,
        execution: PlaybookExecution,
        snapshots: &'a watch::Sender<PlaybookExecution>,
    ) -> Self {
        let mut templates = TemplateContext::new(execution.params.clone());
        for result in execution.step_results.values() {
            if result.status == StepStatus::Success {
                templates.set_step_output(result.step_id.clone(), result.output.clone());
            }
        }

        Self {
            coordinator,
            scope: StepScope {
                execution_id: execution.id,
                playbook_id: execution.playbook_id.clone(),
            },
            playbook,
            sequence: execution.last_sequence(),
            templates,
            running: BTreeSet::new(),
            execution,
            snapshots,
        }
    }

    /// Resolve the dependency graph once and check the layering invariant
    fn prepare(&self) -> Result<DependencyGraph> {
        let graph = DependencyGraph::build(&self.playbook)?;
        graph::verify_layers(&self.playbook, graph.layers()).map_err(|e| {
            AppError::Internal(format!("resolver produced an unsound layering: {}", e))
        })?;
        Ok(graph)
    }

    async fn drive(&mut self, graph: DependencyGraph, cancel: &CancellationToken) -> Result<()> {
        let order: Vec<StepId> = graph.execution_order().cloned().collect();

        match self.execution.status {
            ExecutionStatus::Pending => {
                if cancel.is_cancelled() {
                    return self.finish(&order, Some(Abort::Cancelled)).await;
                }
                self.transition(StatusUpdate::to(ExecutionStatus::Running)).await?;
                info!(
                    execution_id = %self.execution.id,
                    playbook_id = %self.playbook.id,
                    version = self.playbook.version,
                    steps = order.len(),
                    layers = graph.layers().len(),
                    "🚀 Execution started"
                );
            }
            ExecutionStatus::Running => {
                info!(
                    execution_id = %self.execution.id,
                    playbook_id = %self.playbook.id,
                    recorded = self.execution.step_results.len(),
                    "Resuming execution"
                );
            }
            status => {
                debug!(execution_id = %self.execution.id, status = %status, "Execution already terminal");
                return Ok(());
            }
        }

        let limit = self.coordinator.wall_clock_limit(&self.playbook);
        let deadline = limit.and_then(|limit| {
            let elapsed = (Utc::now() - self.execution.started_at)
                .to_std()
                .unwrap_or_default();
            Instant::now().checked_add(limit.saturating_sub(elapsed))
        });
        // A budget beyond the clock's range never fires
        let wall_clock = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(wall_clock);

        let steps_cancel = cancel.child_token();
        let mut workers: JoinSet<StepResult> = JoinSet::new();
        let mut abort: Option<Abort> = None;

        loop {
            if abort.is_none() {
                self.propagate_skips(&graph, &order).await?;
                self.dispatch_ready(&graph, &order, &mut workers, &steps_cancel);
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if abort.is_none() => {
                    info!(
                        execution_id = %self.execution.id,
                        in_flight = self.running.len(),
                        "Cancellation requested"
                    );
                    abort = Some(Abort::Cancelled);
                    steps_cancel.cancel();
                }
                _ = &mut wall_clock, if abort.is_none() => {
                    let limit = limit.unwrap_or_default();
                    warn!(
                        execution_id = %self.execution.id,
                        limit_secs = limit.as_secs(),
                        in_flight = self.running.len(),
                        "Wall clock timeout exceeded"
                    );
                    abort = Some(Abort::WallClock(limit));
                    steps_cancel.cancel();
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(result)) => {
                        let result = match abort {
                            Some(reason) => force_skipped(result, reason),
                            None => result,
                        };
                        self.apply_result(result).await?;
                    }
                    Some(Err(e)) => {
                        return Err(AppError::Internal(format!("step worker failed: {}", e)));
                    }
                    None => {}
                },
            }
        }

        self.finish(&order, abort).await
    }

    /// Record `skipped` for every undecided step with a dependency that did not succeed.
    /// Walking in execution order makes the propagation transitive in a single pass.
    async fn propagate_skips(&mut self, graph: &DependencyGraph, order: &[StepId]) -> Result<()> {
        for step_id in order {
            if self.is_decided(step_id) {
                continue;
            }

            let blocker = graph.upstream(step_id).find_map(|dep| {
                self.execution
                    .step_results
                    .get(dep)
                    .filter(|result| result.status != StepStatus::Success)
                    .map(|result| {
                        let root = match &result.error {
                            Some(err) if err.kind == StepErrorKind::UpstreamFailure => {
                                err.caused_by.clone().unwrap_or_else(|| dep.clone())
                            }
                            _ => dep.clone(),
                        };
                        (dep.clone(), result.status, root)
                    })
            });

            if let Some((dependency, status, root)) = blocker {
                info!(
                    execution_id = %self.execution.id,
                    step_id = %step_id,
                    dependency = %dependency,
                    caused_by = %root,
                    "Skipping step blocked by upstream failure"
                );
                let result =
                    StepResult::skipped(step_id.clone(), StepError::upstream(&root, &dependency, status));
                self.apply_result(result).await?;
            }
        }
        Ok(())
    }

    fn dispatch_ready(
        &mut self,
        graph: &DependencyGraph,
        order: &[StepId],
        workers: &mut JoinSet<StepResult>,
        steps_cancel: &CancellationToken,
    ) {
        let limit = self.coordinator.config.max_parallel_steps.max(1);
        let mut dispatched = false;

        for step_id in order {
            if self.running.len() >= limit {
                break;
            }
            if self.is_decided(step_id) {
                continue;
            }
            let ready = graph.upstream(step_id).all(|dep| {
                self.execution
                    .step_results
                    .get(dep)
                    .map_or(false, |result| result.status == StepStatus::Success)
            });
            if !ready {
                continue;
            }
            let Some(step) = self.playbook.step(step_id).cloned() else {
                continue;
            };

            let params = self.templates.substitute_parameters(&step.params);
            let runner = self.coordinator.runner.clone();
            let pool = self.coordinator.workers.clone();
            let scope = self.scope.clone();
            let cancel = steps_cancel.clone();

            debug!(
                execution_id = %self.execution.id,
                step_id = %step.id,
                action = %step.action,
                "Dispatching step"
            );

            let worker_step_id = step.id.clone();
            workers.spawn(async move {
                let work = async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = pool.acquire_owned() => permit.ok(),
                    };
                    runner.run(&scope, &step, params, &cancel).await
                };

                match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        let now = Utc::now();
                        StepResult {
                            step_id: worker_step_id,
                            status: StepStatus::Failed,
                            attempts: 1,
                            output: JsonValue::Null,
                            error: Some(StepError::new(
                                StepErrorKind::HandlerFailure,
                                "step worker panicked",
                            )),
                            started_at: now,
                            finished_at: now,
                            sequence: 0,
                        }
                    }
                }
            });

            self.running.insert(step_id.clone());
            self.coordinator
                .events
                .publish(ExecutionEvent::dispatched(self.execution.id, step_id));
            dispatched = true;
        }

        if dispatched {
            self.publish_snapshot();
        }
    }

    /// Stamp, persist and fold one final step result into the schedule
    async fn apply_result(&mut self, mut result: StepResult) -> Result<()> {
        self.sequence += 1;
        result.sequence = self.sequence;

        let id = self.execution.id;
        let store = &self.coordinator.store;
        let persisted = with_store_retry(&self.coordinator.config.store_retry, "append_step_result", || {
            store.append_step_result(&id, &result)
        })
        .await;

        match persisted {
            Ok(()) => {}
            Err(StoreError::Conflict(message)) => {
                warn!(
                    execution_id = %id,
                    step_id = %result.step_id,
                    message = %message,
                    "Step result was already recorded"
                );
            }
            Err(err) => return Err(err.into()),
        }

        let action = self
            .playbook
            .step(&result.step_id)
            .map(|step| step.action.as_str())
            .unwrap_or("unknown");
        let status = result.status.to_string();
        STEP_RESULTS_TOTAL
            .with_label_values(&[action, status.as_str()])
            .inc();
        if result.attempts > 0 {
            STEP_ATTEMPTS
                .with_label_values(&[action])
                .observe(f64::from(result.attempts));
            STEP_DURATION_SECONDS
                .with_label_values(&[action])
                .observe(result.duration().num_milliseconds().max(0) as f64 / 1000.0);
        }

        match result.status {
            StepStatus::Success => {
                info!(
                    execution_id = %id,
                    step_id = %result.step_id,
                    attempts = result.attempts,
                    sequence = result.sequence,
                    "✅ Step succeeded"
                );
                self.templates
                    .set_step_output(result.step_id.clone(), result.output.clone());
            }
            StepStatus::Failed | StepStatus::Timeout => {
                warn!(
                    execution_id = %id,
                    step_id = %result.step_id,
                    status = %result.status,
                    attempts = result.attempts,
                    error = ?result.error.as_ref().map(|e| e.message.as_str()),
                    "❌ Step failed"
                );
            }
            StepStatus::Skipped => {
                debug!(
                    execution_id = %id,
                    step_id = %result.step_id,
                    reason = ?result.error.as_ref().map(|e| e.kind),
                    "Step skipped"
                );
            }
        }

        self.coordinator.events.publish(ExecutionEvent::finished(
            id,
            &result.step_id,
            result.status,
            result.attempts,
            result.sequence,
        ));

        self.running.remove(&result.step_id);
        self.execution
            .step_results
            .insert(result.step_id.clone(), result);
        self.publish_snapshot();
        Ok(())
    }

    /// Record undispatched steps after an abort and move to the terminal state
    async fn finish(&mut self, order: &[StepId], abort: Option<Abort>) -> Result<()> {
        if let Some(reason) = abort {
            let message = match reason {
                Abort::Cancelled => "execution cancelled before the step was dispatched",
                Abort::WallClock(_) => "wall clock timeout reached before the step was dispatched",
            };
            for step_id in order {
                if !self.is_decided(step_id) {
                    self.apply_result(StepResult::skipped(step_id.clone(), StepError::cancelled(message)))
                        .await?;
                }
            }
        }

        let update = match abort {
            Some(Abort::Cancelled) => StatusUpdate::to(ExecutionStatus::Cancelled),
            Some(Abort::WallClock(limit)) => StatusUpdate::to(ExecutionStatus::Failed)
                .with_failure(ExecutionFailure::WallClockTimeout {
                    limit_secs: limit.as_secs(),
                }),
            None => {
                let failed = self.execution.failed_steps();
                if failed.is_empty() {
                    StatusUpdate::to(ExecutionStatus::Succeeded)
                } else {
                    StatusUpdate::to(ExecutionStatus::Failed)
                        .with_failure(ExecutionFailure::StepsFailed { steps: failed })
                }
            }
        };

        self.transition(update).await?;
        self.record_completion();

        info!(
            execution_id = %self.execution.id,
            playbook_id = %self.playbook.id,
            status = %self.execution.status,
            steps = self.execution.step_results.len(),
            failure = ?self.execution.failure,
            "Execution finished"
        );
        Ok(())
    }

    /// CAS the execution status with store retries
    async fn transition(&mut self, update: StatusUpdate) -> Result<()> {
        let id = self.execution.id;
        let expected = self.execution.revision;
        let store = &self.coordinator.store;
        let revision = with_store_retry(
            &self.coordinator.config.store_retry,
            "compare_and_set_status",
            || store.compare_and_set_status(&id, expected, update.clone()),
        )
        .await?;

        self.apply_update(update, revision);
        Ok(())
    }

    fn apply_update(&mut self, update: StatusUpdate, revision: u64) {
        self.execution.status = update.status;
        if update.completed_at.is_some() {
            self.execution.completed_at = update.completed_at;
        }
        if update.failure.is_some() {
            self.execution.failure = update.failure;
        }
        self.execution.revision = revision;

        self.coordinator
            .events
            .publish(ExecutionEvent::execution(self.execution.id, self.execution.status));
        self.publish_snapshot();
    }

    /// Best-effort terminal marking after a hard failure. Waiters are always released.
    async fn fail_infrastructure(&mut self, err: &AppError) {
        error!(
            execution_id = %self.execution.id,
            playbook_id = %self.playbook.id,
            error = %err,
            "Execution aborted by infrastructure failure"
        );
        ERRORS_TOTAL.with_label_values(&["infrastructure"]).inc();

        if self.execution.is_terminal() {
            return;
        }

        let update = StatusUpdate::to(ExecutionStatus::Failed).with_failure(
            ExecutionFailure::Infrastructure {
                message: err.to_string(),
            },
        );
        let coordinator = self.coordinator;
        let store = &coordinator.store;
        let id = self.execution.id;
        let mut outcome = store
            .compare_and_set_status(&id, self.execution.revision, update.clone())
            .await;
        if let Err(StoreError::Conflict(_)) = outcome {
            // The local revision may be stale if the driver stopped mid-transition
            outcome = match store.get_execution(&id).await {
                Ok(stored) if !stored.is_terminal() => {
                    store
                        .compare_and_set_status(&id, stored.revision, update.clone())
                        .await
                }
                Ok(stored) => {
                    self.running.clear();
                    self.execution = stored;
                    self.publish_snapshot();
                    return;
                }
                Err(e) => Err(e),
            };
        }
        let revision = match outcome {
            Ok(revision) => revision,
            Err(store_err) => {
                warn!(
                    execution_id = %self.execution.id,
                    error = %store_err,
                    "Could not persist infrastructure failure"
                );
                self.execution.revision
            }
        };

        self.running.clear();
        self.apply_update(update, revision);
        self.record_completion();
    }

    fn record_completion(&self) {
        let status = self.execution.status.to_string();
        EXECUTIONS_TOTAL
            .with_label_values(&[self.playbook.id.as_str(), status.as_str()])
            .inc();
        if let Some(duration) = self.execution.duration() {
            EXECUTION_DURATION_SECONDS
                .with_label_values(&[self.playbook.id.as_str()])
                .observe(duration.num_milliseconds().max(0) as f64 / 1000.0);
        }
    }

    fn is_decided(&self, step_id: &str) -> bool {
        self.execution.step_results.contains_key(step_id) || self.running.contains(step_id)
    }

    fn publish_snapshot(&mut self) {
        self.execution.currently_running = self.running.clone();
        self.snapshots.send_replace(self.execution.clone());
    }
}

/// Results arriving after cancellation never count as outcomes
fn force_skipped(mut result: StepResult, reason: Abort) -> StepResult {
    if result.status == StepStatus::Skipped {
        return result;
    }
    let message = match reason {
        Abort::Cancelled => "execution cancelled while the step was running",
        Abort::WallClock(_) => "wall clock timeout reached while the step was running",
    };
    result.status = StepStatus::Skipped;
    result.output = JsonValue::Null;
    result.error = Some(StepError::cancelled(message));
    result
}
