use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::playbook::{Params, Playbook, StepId};

/// Execution lifecycle: `pending -> running -> (succeeded | failed | cancelled)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // a pending execution can be cancelled or fail on infrastructure before dispatch
            (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

/// Final outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

impl StepStatus {
    /// `failed` and `timeout` fail the execution, `skipped` does not
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Timeout)
    }
}

/// Classification of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepErrorKind {
    UnknownAction,
    InvalidParams,
    HandlerFailure,
    Timeout,
    Cancelled,
    UpstreamFailure,
}

/// Structured failure reason attached to a step result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,

    /// Step whose outcome caused this one to be skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<StepId>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            caused_by: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Cancelled, message)
    }

    /// Skip caused by a dependency that did not succeed
    pub fn upstream(root: &str, dependency: &str, dependency_status: StepStatus) -> Self {
        Self {
            kind: StepErrorKind::UpstreamFailure,
            message: format!(
                "dependency '{}' finished with status '{}'",
                dependency, dependency_status
            ),
            caused_by: Some(root.to_string()),
        }
    }
}

/// Outcome of one step's attempt sequence. Recorded exactly once per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,

    /// Attempts actually made
    pub attempts: u32,

    #[serde(default)]
    pub output: JsonValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Order in which the coordinator applied this result; 0 until applied
    #[serde(default)]
    pub sequence: u64,
}

impl StepResult {
    /// Result for a step that was never dispatched
    pub fn skipped(step_id: impl Into<String>, error: StepError) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            attempts: 0,
            output: JsonValue::Null,
            error: Some(error),
            started_at: now,
            finished_at: now,
            sequence: 0,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Why an execution ended in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// One or more steps finished `failed` or `timeout`
    StepsFailed { steps: Vec<StepId> },

    /// The playbook wall-clock budget was exceeded
    WallClockTimeout { limit_secs: u64 },

    /// The execution store stayed unavailable
    Infrastructure { message: String },
}

/// One run of a pinned playbook version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookExecution {
    pub id: Uuid,
    pub playbook_id: String,
    pub playbook_version: u32,
    pub triggered_by: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub step_results: BTreeMap<StepId, StepResult>,

    #[serde(default)]
    pub currently_running: BTreeSet<StepId>,

    /// Initial parameters supplied by the trigger
    #[serde(default)]
    pub params: Params,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,

    /// Optimistic concurrency token for status updates
    #[serde(default)]
    pub revision: u64,
}

impl PlaybookExecution {
    /// Create a pending execution pinned to `playbook`'s version
    pub fn new(playbook: &Playbook, triggered_by: impl Into<String>, params: Params) -> Self {
        Self {
            id: Uuid::now_v7(),
            playbook_id: playbook.id.clone(),
            playbook_version: playbook.version,
            triggered_by: triggered_by.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            step_results: BTreeMap::new(),
            currently_running: BTreeSet::new(),
            params,
            failure: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    /// Steps whose final status is `failed` or `timeout`, in step id order
    pub fn failed_steps(&self) -> Vec<StepId> {
        self.step_results
            .values()
            .filter(|r| r.status.is_failure())
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Highest sequence stamped on a recorded result
    pub fn last_sequence(&self) -> u64 {
        self.step_results
            .values()
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}
