pub mod factory;
pub mod sled_store;
pub mod store;

pub use factory::{create_in_memory_store, create_store};
pub use sled_store::SledExecutionStore;
pub use store::InMemoryExecutionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ExecutionFailure, ExecutionStatus, PlaybookExecution, StepResult};

/// Persistence failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(String),

    /// Stale revision, disallowed transition or duplicate step result
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend could not be reached or failed an operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Only availability failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Status change applied with optimistic concurrency
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<ExecutionFailure>,
}

impl StatusUpdate {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            completed_at: status.is_terminal().then(Utc::now),
            status,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: ExecutionFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub playbook_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &PlaybookExecution) -> bool {
        self.playbook_id
            .as_ref()
            .map_or(true, |id| *id == execution.playbook_id)
            && self.status.map_or(true, |status| status == execution.status)
    }
}

/// Durable record of executions.
///
/// Each execution is an append-only step-result log plus a status field guarded by a
/// revision number. Implementations must make `append_step_result` and
/// `compare_and_set_status` atomic.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new execution. Fails with `Conflict` if the id already exists.
    async fn create_execution(&self, execution: &PlaybookExecution) -> StoreResult<()>;

    /// Current record including every appended step result
    async fn get_execution(&self, id: &Uuid) -> StoreResult<PlaybookExecution>;

    /// Append the final result of one step. A second result for the same step is
    /// rejected with `Conflict`.
    async fn append_step_result(&self, id: &Uuid, result: &StepResult) -> StoreResult<()>;

    /// Apply `update` if the stored revision equals `expected_revision` and the state
    /// machine allows the transition. Returns the new revision.
    async fn compare_and_set_status(
        &self,
        id: &Uuid,
        expected_revision: u64,
        update: StatusUpdate,
    ) -> StoreResult<u64>;

    /// Executions matching `filter`, newest first
    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<PlaybookExecution>>;

    /// Backend name used in logs and metrics
    fn backend(&self) -> &'static str;
}

/// Shared CAS validation used by every backend
pub(crate) fn apply_status_update(
    current: &mut PlaybookExecution,
    expected_revision: u64,
    update: StatusUpdate,
) -> StoreResult<u64> {
    if current.revision != expected_revision {
        return Err(StoreError::Conflict(format!(
            "execution {} is at revision {}, expected {}",
            current.id, current.revision, expected_revision
        )));
    }
    if current.status != update.status && !current.status.can_transition_to(update.status) {
        return Err(StoreError::Conflict(format!(
            "execution {} cannot move from {} to {}",
            current.id, current.status, update.status
        )));
    }

    current.status = update.status;
    if update.completed_at.is_some() {
        current.completed_at = update.completed_at;
    }
    if update.failure.is_some() {
        current.failure = update.failure;
    }
    current.revision += 1;
    Ok(current.revision)
}

/// Newest first, then truncate to the filter's limit
pub(crate) fn sort_and_limit(mut executions: Vec<PlaybookExecution>, filter: &ExecutionFilter) -> Vec<PlaybookExecution> {
    executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
    if let Some(limit) = filter.limit {
        executions.truncate(limit);
    }
    executions
}
