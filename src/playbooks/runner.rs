//! Single-step execution: per-attempt timeout, retry with backoff, outcome classification.

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::actions::{ActionContext, ActionError, ActionRegistry};
use crate::models::{
    BackoffStrategy, Params, Playbook, PlaybookStep, StepError, StepErrorKind, StepResult,
    StepStatus,
};

/// Backoff parameters shared by every step runner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Fraction of the computed delay applied as random jitter in either direction
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based),
    /// without jitter
    pub fn base_backoff(&self, strategy: BackoffStrategy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Backoff with jitter applied, never above `max_delay`
    pub fn backoff(&self, strategy: BackoffStrategy, attempt: u32) -> Duration {
        let delay = self.base_backoff(strategy, attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }

        let ratio = self.jitter_ratio.min(1.0);
        let factor: f64 = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
    }

    /// Upper bound on how long `playbook` can take if every step exhausts its attempts
    /// and every step ran one after another
    pub fn worst_case_duration(&self, playbook: &Playbook) -> Duration {
        playbook
            .steps
            .iter()
            .map(|step| {
                let attempts = step.retries.saturating_add(1);
                let running = step.timeout.saturating_mul(attempts);
                let waiting = (1..attempts)
                    .map(|attempt| self.base_backoff(step.backoff, attempt))
                    .fold(Duration::ZERO, Duration::saturating_add);
                running.saturating_add(waiting)
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Identifies the execution a step belongs to
#[derive(Debug, Clone)]
pub struct StepScope {
    pub execution_id: Uuid,
    pub playbook_id: String,
}

enum Attempt {
    Completed(Result<JsonValue, ActionError>),
    TimedOut,
    Cancelled,
}

/// Runs one step to a final [`StepResult`]
#[derive(Clone)]
pub struct StepRunner {
    registry: Arc<ActionRegistry>,
    policy: RetryPolicy,
}

impl StepRunner {
    pub fn new(registry: Arc<ActionRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `step` with already-resolved `params`.
    ///
    /// The handler is invoked at most `step.retries + 1` times. Unknown actions and
    /// invalid params fail on the first attempt without invoking anything. Cancellation
    /// is observed mid-attempt and during backoff and yields a `skipped` result.
    pub async fn run(
        &self,
        scope: &StepScope,
        step: &PlaybookStep,
        params: Params,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();
        let finish = |status: StepStatus, attempts: u32, output: JsonValue, error: Option<StepError>| {
            StepResult {
                step_id: step.id.clone(),
                status,
                attempts,
                output,
                error,
                started_at,
                finished_at: Utc::now(),
                sequence: 0,
            }
        };

        if cancel.is_cancelled() {
            return finish(
                StepStatus::Skipped,
                0,
                JsonValue::Null,
                Some(StepError::cancelled("execution cancelled before dispatch")),
            );
        }

        let handler = match self.registry.get(&step.action) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(
                    execution_id = %scope.execution_id,
                    step_id = %step.id,
                    action = %step.action,
                    "Step references an unregistered action"
                );
                return finish(StepStatus::Failed, 1, JsonValue::Null, Some(err.into()));
            }
        };

        if let Err(message) = handler.schema().validate(&params) {
            let err = ActionError::InvalidParams {
                action: step.action.clone(),
                message,
            };
            warn!(
                execution_id = %scope.execution_id,
                step_id = %step.id,
                error = %err,
                "Step params rejected"
            );
            return finish(StepStatus::Failed, 1, JsonValue::Null, Some(err.into()));
        }

        let max_attempts = step.retries.saturating_add(1);
        let mut last_error = StepError::new(StepErrorKind::HandlerFailure, "step did not run");
        let mut timed_out = false;

        for attempt in 1..=max_attempts {
            let ctx = ActionContext {
                execution_id: scope.execution_id,
                playbook_id: scope.playbook_id.clone(),
                step_id: step.id.clone(),
                attempt,
                cancellation: cancel.child_token(),
            };

            debug!(
                execution_id = %scope.execution_id,
                step_id = %step.id,
                attempt = attempt,
                "Invoking action handler"
            );

            let invocation = AssertUnwindSafe(handler.invoke(&ctx, &params)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                result = tokio::time::timeout(step.timeout, invocation) => match result {
                    Ok(Ok(result)) => Attempt::Completed(result),
                    Ok(Err(_panic)) => Attempt::Completed(Err(ActionError::failure("action handler panicked"))),
                    Err(_) => Attempt::TimedOut,
                },
            };

            match outcome {
                Attempt::Completed(Ok(output)) => {
                    return finish(StepStatus::Success, attempt, output, None);
                }
                Attempt::Cancelled => {
                    return finish(
                        StepStatus::Skipped,
                        attempt,
                        JsonValue::Null,
                        Some(StepError::cancelled(format!(
                            "execution cancelled during attempt {}",
                            attempt
                        ))),
                    );
                }
                // handlers that bail out on cancellation report the cancel, not their error
                Attempt::Completed(Err(_)) | Attempt::TimedOut if cancel.is_cancelled() => {
                    return finish(
                        StepStatus::Skipped,
                        attempt,
                        JsonValue::Null,
                        Some(StepError::cancelled(format!(
                            "execution cancelled during attempt {}",
                            attempt
                        ))),
                    );
                }
                Attempt::Completed(Err(err)) if !err.is_retryable() => {
                    return finish(StepStatus::Failed, attempt, JsonValue::Null, Some(err.into()));
                }
                Attempt::Completed(Err(err)) => {
                    warn!(
                        execution_id = %scope.execution_id,
                        step_id = %step.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %err,
                        "Step attempt failed"
                    );
                    last_error = err.into();
                    timed_out = false;
                }
                Attempt::TimedOut => {
                    warn!(
                        execution_id = %scope.execution_id,
                        step_id = %step.id,
                        attempt = attempt,
                        timeout_ms = step.timeout.as_millis() as u64,
                        "Step attempt timed out"
                    );
                    last_error = StepError::new(
                        StepErrorKind::Timeout,
                        format!("attempt {} timed out after {:?}", attempt, step.timeout),
                    );
                    timed_out = true;
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff(step.backoff, attempt);
                debug!(
                    execution_id = %scope.execution_id,
                    step_id = %step.id,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return finish(
                            StepStatus::Skipped,
                            attempt,
                            JsonValue::Null,
                            Some(StepError::cancelled("execution cancelled while waiting to retry")),
                        );
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let status = if timed_out {
            StepStatus::Timeout
        } else {
            StepStatus::Failed
        };
        finish(status, max_attempts, JsonValue::Null, Some(last_error))
    }
}
