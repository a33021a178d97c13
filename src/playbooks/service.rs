use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::coordinator::{with_store_retry, ExecutionCoordinator};
use super::events::{EventStats, ExecutionEvent};
use super::graph;
use super::repository::{validate_definition, PlaybookRepository};
use crate::error::{AppError, Result};
use crate::models::{
    ExecutionFailure, ExecutionStatus, Params, Playbook, PlaybookExecution, StepId,
};
use crate::state::{ExecutionFilter, ExecutionStore, StatusUpdate, StoreError};

/// Handle on an execution driven by this process
struct ActiveExecution {
    cancel: CancellationToken,
    snapshots: watch::Receiver<PlaybookExecution>,
}

/// Outcome of a dry-run validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub layers: Vec<Vec<StepId>>,

    /// Actions referenced by steps but not registered; such steps would fail at dispatch
    pub unknown_actions: Vec<String>,
}

/// Entry point for triggering, querying and cancelling playbook executions
#[derive(Clone)]
pub struct PlaybookService {
    repository: Arc<dyn PlaybookRepository>,
    coordinator: ExecutionCoordinator,
    active: Arc<DashMap<Uuid, ActiveExecution>>,
}

impl PlaybookService {
    pub fn new(repository: Arc<dyn PlaybookRepository>, coordinator: ExecutionCoordinator) -> Self {
        Self {
            repository,
            coordinator,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn PlaybookRepository> {
        &self.repository
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Publish a new playbook version
    pub async fn publish_playbook(&self, playbook: Playbook) -> Result<Arc<Playbook>> {
        self.repository.publish(playbook).await
    }

    pub async fn get_playbook(&self, id: &str, version: Option<u32>) -> Result<Arc<Playbook>> {
        self.repository.get_playbook(id, version).await
    }

    pub async fn list_playbooks(&self) -> Result<Vec<Arc<Playbook>>> {
        self.repository.list_playbooks().await
    }

    /// Validate a definition without publishing it
    pub fn validate_playbook(&self, playbook: &Playbook) -> Result<ValidationReport> {
        validate_definition(playbook)?;
        let layers = graph::topological_layers(playbook)?;

        let registry = self.coordinator.runner().registry();
        let mut unknown_actions: Vec<String> = playbook
            .steps
            .iter()
            .filter(|step| !registry.contains(&step.action))
            .map(|step| step.action.clone())
            .collect();
        unknown_actions.sort();
        unknown_actions.dedup();

        Ok(ValidationReport {
            layers,
            unknown_actions,
        })
    }

    /// Accept an execution request and drive it in the background.
    ///
    /// The playbook graph is validated first; a malformed playbook never produces an
    /// execution record.
    pub async fn start_execution(
        &self,
        playbook_id: &str,
        version: Option<u32>,
        triggered_by: &str,
        params: Params,
    ) -> Result<Uuid> {
        let playbook = self.repository.get_playbook(playbook_id, version).await?;

        if !playbook.is_executable() {
            return Err(AppError::Validation(format!(
                "Playbook {} version {} is {} and cannot be executed",
                playbook.id, playbook.version, playbook.status
            )));
        }
        graph::validate(&playbook)?;

        let execution = PlaybookExecution::new(&playbook, triggered_by, params);
        let store = self.coordinator.store();
        with_store_retry(
            &self.coordinator.config().store_retry,
            "create_execution",
            || store.create_execution(&execution),
        )
        .await?;

        info!(
            execution_id = %execution.id,
            playbook_id = %playbook.id,
            version = playbook.version,
            triggered_by = %triggered_by,
            "Execution accepted"
        );

        let id = execution.id;
        self.spawn(playbook, execution);
        Ok(id)
    }

    fn spawn(&self, playbook: Arc<Playbook>, execution: PlaybookExecution) {
        let id = execution.id;
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(execution.clone());

        self.active.insert(
            id,
            ActiveExecution {
                cancel: cancel.clone(),
                snapshots: rx,
            },
        );

        let coordinator = self.coordinator.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(coordinator.run(playbook, execution, cancel, &tx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(execution_id = %id, error = %e, "Execution coordinator stopped");
                }
                Err(_) => {
                    error!(execution_id = %id, "Execution coordinator panicked");
                    if let Some(settled) = settle_abandoned(coordinator.store().as_ref(), &id).await
                    {
                        tx.send_replace(settled);
                    }
                }
            }
            active.remove(&id);
        });
    }

    /// Current snapshot, including partial step results
    pub async fn get_execution(&self, id: &Uuid) -> Result<PlaybookExecution> {
        if let Some(active) = self.active.get(id) {
            return Ok(active.snapshots.borrow().clone());
        }

        self.coordinator
            .store()
            .get_execution(id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => AppError::NotFound(format!("Execution {} not found", id)),
                other => other.into(),
            })
    }

    /// Executions matching `filter`, newest first, with live state for active ones
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<PlaybookExecution>> {
        let mut executions = self.coordinator.store().list_executions(filter).await?;
        for execution in executions.iter_mut() {
            if let Some(active) = self.active.get(&execution.id) {
                *execution = active.snapshots.borrow().clone();
            }
        }
        Ok(executions)
    }

    /// Request cancellation. Idempotent: terminal executions are left untouched and
    /// repeated calls are no-ops.
    pub async fn cancel_execution(&self, id: &Uuid) -> Result<()> {
        if let Some(active) = self.active.get(id) {
            if !active.cancel.is_cancelled() {
                info!(execution_id = %id, "Cancelling execution");
                active.cancel.cancel();
            }
            return Ok(());
        }

        let execution = self.get_execution(id).await?;
        if execution.is_terminal() {
            return Ok(());
        }

        // Not driven by this process; settle the record directly
        warn!(
            execution_id = %id,
            status = %execution.status,
            "Cancelling execution without an active coordinator"
        );
        match self
            .coordinator
            .store()
            .compare_and_set_status(
                id,
                execution.revision,
                StatusUpdate::to(ExecutionStatus::Cancelled),
            )
            .await
        {
            Ok(_) | Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve once the execution reaches a terminal state
    pub async fn wait_for_completion(&self, id: &Uuid) -> Result<PlaybookExecution> {
        let receiver = self.active.get(id).map(|active| active.snapshots.clone());

        if let Some(mut receiver) = receiver {
            let finished = receiver
                .wait_for(|execution| execution.is_terminal())
                .await
                .map(|snapshot| snapshot.clone());
            if let Ok(execution) = finished {
                return Ok(execution);
            }
        }

        self.get_execution(id).await
    }

    /// Re-drive executions left pending or running by a previous process.
    /// Returns the number of executions resumed.
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let mut resumed = 0;

        for status in [ExecutionStatus::Pending, ExecutionStatus::Running] {
            let filter = ExecutionFilter {
                status: Some(status),
                ..ExecutionFilter::default()
            };

            for execution in self.coordinator.store().list_executions(&filter).await? {
                if self.active.contains_key(&execution.id) {
                    continue;
                }

                let playbook = match self
                    .repository
                    .get_playbook(&execution.playbook_id, Some(execution.playbook_version))
                    .await
                {
                    Ok(playbook) => playbook,
                    Err(e) => {
                        warn!(
                            execution_id = %execution.id,
                            playbook_id = %execution.playbook_id,
                            version = execution.playbook_version,
                            error = %e,
                            "Cannot resume execution, pinned playbook unavailable"
                        );
                        continue;
                    }
                };

                info!(
                    execution_id = %execution.id,
                    status = %execution.status,
                    recorded = execution.step_results.len(),
                    "Resuming incomplete execution"
                );
                self.spawn(playbook, execution);
                resumed += 1;
            }
        }

        Ok(resumed)
    }

    /// Live event stream across all executions
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.coordinator.events().subscribe()
    }

    pub fn event_stats(&self) -> EventStats {
        self.coordinator.events().stats()
    }

    /// Number of executions currently driven by this process
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Mark an execution whose coordinator died as failed so it never stays running
async fn settle_abandoned(store: &dyn ExecutionStore, id: &Uuid) -> Option<PlaybookExecution> {
    let execution = store.get_execution(id).await.ok()?;
    if execution.is_terminal() {
        return Some(execution);
    }

    let update = StatusUpdate::to(ExecutionStatus::Failed).with_failure(
        ExecutionFailure::Infrastructure {
            message: "execution coordinator panicked".to_string(),
        },
    );
    if let Err(e) = store
        .compare_and_set_status(id, execution.revision, update)
        .await
    {
        warn!(execution_id = %id, error = %e, "Could not settle abandoned execution");
    }
    store.get_execution(id).await.ok()
}
