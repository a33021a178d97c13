use async_trait::async_trait;
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{
    apply_status_update, sort_and_limit, ExecutionFilter, ExecutionStore, StatusUpdate,
    StoreError, StoreResult,
};
use crate::metrics::record_storage_operation;
use crate::models::{PlaybookExecution, StepResult};

const BACKEND: &str = "sled";

/// Persistent execution store using the Sled embedded database.
///
/// `executions` holds the execution header (everything except step results) keyed by
/// id. `step_results` holds one record per step keyed by `id ++ step_id`, so appends
/// never rewrite the header and the status CAS never touches the result log.
#[derive(Clone)]
pub struct SledExecutionStore {
    db: Arc<Db>,
    executions_tree: sled::Tree,
    results_tree: sled::Tree,
}

impl SledExecutionStore {
    /// Open (or create) a store at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StoreError::Unavailable(format!("Failed to open Sled database: {}", e))
        })?;

        let executions_tree = db.open_tree("executions").map_err(|e| {
            StoreError::Unavailable(format!("Failed to open executions tree: {}", e))
        })?;

        let results_tree = db.open_tree("step_results").map_err(|e| {
            StoreError::Unavailable(format!("Failed to open step_results tree: {}", e))
        })?;

        tracing::info!(path = ?path.as_ref(), "Initialized Sled execution store");

        Ok(Self {
            db: Arc::new(db),
            executions_tree,
            results_tree,
        })
    }

    fn execution_key(id: &Uuid) -> [u8; 16] {
        *id.as_bytes()
    }

    fn result_key(id: &Uuid, step_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + step_id.len());
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(step_id.as_bytes());
        key
    }

    fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn unavailable(context: &str, err: sled::Error) -> StoreError {
        StoreError::Unavailable(format!("{}: {}", context, err))
    }

    fn load_header(&self, id: &Uuid) -> StoreResult<(sled::IVec, PlaybookExecution)> {
        let bytes = self
            .executions_tree
            .get(Self::execution_key(id))
            .map_err(|e| Self::unavailable("Failed to read execution", e))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let header = Self::decode(&bytes)?;
        Ok((bytes, header))
    }

    fn load_results(&self, execution: &mut PlaybookExecution) -> StoreResult<()> {
        for entry in self.results_tree.scan_prefix(execution.id.as_bytes()) {
            let (_, value) = entry.map_err(|e| Self::unavailable("Failed to scan step results", e))?;
            let result: StepResult = Self::decode(&value)?;
            execution.step_results.insert(result.step_id.clone(), result);
        }
        Ok(())
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> StoreResult<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| Self::unavailable("Failed to flush database", e))?;
        Ok(())
    }

    /// Get database size on disk
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        self.db
            .size_on_disk()
            .map_err(|e| Self::unavailable("Failed to get database size", e))
    }
}

#[async_trait]
impl ExecutionStore for SledExecutionStore {
    async fn create_execution(&self, execution: &PlaybookExecution) -> StoreResult<()> {
        let start = Instant::now();
        let result = (|| -> StoreResult<()> {
            let mut header = execution.clone();
            let results = std::mem::take(&mut header.step_results);
            header.currently_running.clear();

            self.executions_tree
                .compare_and_swap(
                    Self::execution_key(&execution.id),
                    None::<&[u8]>,
                    Some(Self::encode(&header)?),
                )
                .map_err(|e| Self::unavailable("Failed to create execution", e))?
                .map_err(|_| {
                    StoreError::Conflict(format!("execution {} already exists", execution.id))
                })?;

            for result in results.values() {
                self.results_tree
                    .insert(Self::result_key(&execution.id, &result.step_id), Self::encode(result)?)
                    .map_err(|e| Self::unavailable("Failed to write step result", e))?;
            }
            Ok(())
        })();

        if result.is_ok() {
            tracing::debug!(execution_id = %execution.id, "Execution created");
        }
        record_storage_operation("create_execution", BACKEND, start, &result);
        result
    }

    async fn get_execution(&self, id: &Uuid) -> StoreResult<PlaybookExecution> {
        let (_, mut execution) = self.load_header(id)?;
        self.load_results(&mut execution)?;
        Ok(execution)
    }

    async fn append_step_result(&self, id: &Uuid, result: &StepResult) -> StoreResult<()> {
        let start = Instant::now();
        let outcome = (|| -> StoreResult<()> {
            let exists = self
                .executions_tree
                .contains_key(Self::execution_key(id))
                .map_err(|e| Self::unavailable("Failed to read execution", e))?;
            if !exists {
                return Err(StoreError::NotFound(id.to_string()));
            }

            self.results_tree
                .compare_and_swap(
                    Self::result_key(id, &result.step_id),
                    None::<&[u8]>,
                    Some(Self::encode(result)?),
                )
                .map_err(|e| Self::unavailable("Failed to append step result", e))?
                .map_err(|_| {
                    StoreError::Conflict(format!(
                        "step '{}' already has a recorded result",
                        result.step_id
                    ))
                })
        })();

        if outcome.is_ok() {
            tracing::debug!(
                execution_id = %id,
                step_id = %result.step_id,
                sequence = result.sequence,
                "Step result appended"
            );
        }
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
        let result = (|| -> StoreResult<u64> {
            let (current_bytes, mut header) = self.load_header(id)?;
            let revision = apply_status_update(&mut header, expected_revision, update)?;

            self.executions_tree
                .compare_and_swap(
                    Self::execution_key(id),
                    Some(current_bytes),
                    Some(Self::encode(&header)?),
                )
                .map_err(|e| Self::unavailable("Failed to update execution status", e))?
                .map_err(|_| {
                    StoreError::Conflict(format!("execution {} was modified concurrently", id))
                })?;
            Ok(revision)
        })();

        record_storage_operation("compare_and_set_status", BACKEND, start, &result);
        result
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<PlaybookExecution>> {
        let mut executions = Vec::new();
        for entry in self.executions_tree.iter() {
            let (_, value) = entry.map_err(|e| Self::unavailable("Failed to scan executions", e))?;
            let mut execution: PlaybookExecution = Self::decode(&value)?;
            if filter.matches(&execution) {
                self.load_results(&mut execution)?;
                executions.push(execution);
            }
        }
        Ok(sort_and_limit(executions, filter))
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
