//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use llm_playbook_engine::{
    models::{Params, PlaybookExecution, StepResult},
    playbooks::{
        ActionError, ActionRegistry, CoordinatorConfig, EventBus, ExecutionCoordinator,
        InMemoryPlaybookRepository, ParamKind, ParamSchema, PlaybookService, RetryPolicy,
        StepRunner, StoreRetryPolicy,
    },
    state::{
        ExecutionFilter, ExecutionStore, InMemoryExecutionStore, StatusUpdate, StoreError,
        StoreResult,
    },
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Retry policy without multi-second backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter_ratio: 0.0,
    }
}

pub fn fast_store_retry(max_attempts: u32) -> StoreRetryPolicy {
    StoreRetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

/// Invocation counters per action key
#[derive(Clone, Default)]
pub struct Calls {
    pub flaky: Arc<AtomicU32>,
    pub fail: Arc<AtomicU32>,
}

/// Registry of deterministic test actions:
/// `ok`, `fail`, `echo`, `slow` (`duration_ms`, cancellable) and `flaky`
/// (fails `failures` times then succeeds).
pub fn test_registry(calls: &Calls) -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.register_fn("ok", ParamSchema::new(), |ctx, _params| {
        let step_id = ctx.step_id.clone();
        async move { Ok(json!({ "step": step_id })) }
    });

    let fail = calls.fail.clone();
    registry.register_fn("fail", ParamSchema::new(), move |_ctx, _params| {
        fail.fetch_add(1, Ordering::SeqCst);
        async move { Err(ActionError::failure("handler always fails")) }
    });

    registry.register_fn("echo", ParamSchema::new(), |_ctx, params| async move {
        Ok(serde_json::Value::Object(params))
    });

    registry.register_fn(
        "slow",
        ParamSchema::new().required("duration_ms", ParamKind::Integer),
        |ctx, params| async move {
            let millis = params
                .get("duration_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(1000);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(json!({ "slept_ms": millis })),
                _ = ctx.cancellation.cancelled() => Err(ActionError::failure("interrupted")),
            }
        },
    );

    let flaky = calls.flaky.clone();
    registry.register_fn(
        "flaky",
        ParamSchema::new().required("failures", ParamKind::Integer),
        move |_ctx, params| {
            let attempt = flaky.fetch_add(1, Ordering::SeqCst) + 1;
            let failures = params
                .get("failures")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            async move {
                if attempt <= failures {
                    Err(ActionError::failure(format!("transient failure {}", attempt)))
                } else {
                    Ok(json!({ "attempt": attempt }))
                }
            }
        },
    );

    registry
}

pub struct Harness {
    pub service: PlaybookService,
    pub repository: Arc<InMemoryPlaybookRepository>,
    pub store: Arc<dyn ExecutionStore>,
    pub calls: Calls,
}

pub fn harness() -> Harness {
    harness_with(
        Arc::new(InMemoryExecutionStore::new()),
        CoordinatorConfig::default(),
    )
}

pub fn harness_with(store: Arc<dyn ExecutionStore>, config: CoordinatorConfig) -> Harness {
    let calls = Calls::default();
    let runner = StepRunner::new(Arc::new(test_registry(&calls)), fast_retry());
    let coordinator = ExecutionCoordinator::new(store.clone(), runner, 32, EventBus::new(256), config);
    let repository = Arc::new(InMemoryPlaybookRepository::new());
    let service = PlaybookService::new(repository.clone(), coordinator);

    Harness {
        service,
        repository,
        store,
        calls,
    }
}

/// Store wrapper that reports `Unavailable` for the next `outage` writes
pub struct FlakyStore {
    inner: Arc<dyn ExecutionStore>,
    outage: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ExecutionStore>) -> Self {
        Self {
            inner,
            outage: AtomicU32::new(0),
        }
    }

    /// Fail the next `writes` append/CAS calls
    pub fn fail_next(&self, writes: u32) {
        self.outage.store(writes, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        let remaining = self.outage.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outage.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn create_execution(&self, execution: &PlaybookExecution) -> StoreResult<()> {
        self.inner.create_execution(execution).await
    }

    async fn get_execution(&self, id: &Uuid) -> StoreResult<PlaybookExecution> {
        self.inner.get_execution(id).await
    }

    async fn append_step_result(&self, id: &Uuid, result: &StepResult) -> StoreResult<()> {
        self.check()?;
        self.inner.append_step_result(id, result).await
    }

    async fn compare_and_set_status(
        &self,
        id: &Uuid,
        expected_revision: u64,
        update: StatusUpdate,
    ) -> StoreResult<u64> {
        self.check()?;
        self.inner
            .compare_and_set_status(id, expected_revision, update)
            .await
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<PlaybookExecution>> {
        self.inner.list_executions(filter).await
    }

    fn backend(&self) -> &'static str {
        "flaky"
    }
}

/// Store wrapper whose step-result writes panic, modelling a crashing driver
pub struct PanickingStore {
    inner: Arc<dyn ExecutionStore>,
}

impl PanickingStore {
    pub fn new(inner: Arc<dyn ExecutionStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ExecutionStore for PanickingStore {
    async fn create_execution(&self, execution: &PlaybookExecution) -> StoreResult<()> {
        self.inner.create_execution(execution).await
    }

    async fn get_execution(&self, id: &Uuid) -> StoreResult<PlaybookExecution> {
        self.inner.get_execution(id).await
    }

    async fn append_step_result(&self, _id: &Uuid, result: &StepResult) -> StoreResult<()> {
        panic!("step result write for {} crashed", result.step_id);
    }

    async fn compare_and_set_status(
        &self,
        id: &Uuid,
        expected_revision: u64,
        update: StatusUpdate,
    ) -> StoreResult<u64> {
        self.inner
            .compare_and_set_status(id, expected_revision, update)
            .await
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<PlaybookExecution>> {
        self.inner.list_executions(filter).await
    }

    fn backend(&self) -> &'static str {
        "panicking"
    }
}

pub fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Params::new(),
    }
}
