use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{
    apply_status_update, sort_and_limit, ExecutionFilter, ExecutionStore, StatusUpdate,
    StoreError, StoreResult,
};
use crate::metrics::record_storage_operation;
use crate::models::{PlaybookExecution, StepResult};

const BACKEND: &str = "memory";

/// In-memory execution store (for development and testing)
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<DashMap<Uuid, PlaybookExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: &PlaybookExecution) -> StoreResult<()> {
        let start = Instant::now();
        let result = match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                tracing::debug!(execution_id = %execution.id, "Execution created");
                Ok(())
            }
        };
        record_storage_operation("create_execution", BACKEND, start, &result);
        result
    }

    async fn get_execution(&self, id: &Uuid) -> StoreResult<PlaybookExecution> {
        self.executions
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn append_step_result(&self, id: &Uuid, result: &StepResult) -> StoreResult<()> {
        let start = Instant::now();
        let outcome = match self.executions.get_mut(id) {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(mut execution) => {
                if execution.step_results.contains_key(&result.step_id) {
                    Err(StoreError::Conflict(format!(
                        "step '{}' already has a recorded result",
                        result.step_id
                    )))
                } else {
                    execution
                        .step_results
                        .insert(result.step_id.clone(), result.clone());
                    tracing::debug!(
                        execution_id = %id,
                        step_id = %result.step_id,
                        sequence = result.sequence,
                        "Step result appended"
                    );
                    Ok(())
                }
            }
        };
        record_storage_operation("append_step_result", BACKEND, start, &outcome);
        outcome
    }

    async fn compare_and_set_status(
        &self,
        id: &Uuid,
        expected_revision: u64,
        update: StatusUpdate,
    ) -> StoreResult<u64> {
        let start = Instant::now();
        let result = match self.executions.get_mut(id) {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(mut execution) => apply_status_update(&mut execution, expected_revision, update),
        };
        record_storage_operation("compare_and_set_status", BACKEND, start, &result);
        result
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<PlaybookExecution>> {
        let executions = self
            .executions
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(sort_and_limit(executions, filter))
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
