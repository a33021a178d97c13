use llm_playbook_engine::{
    models::{
        ExecutionFailure, ExecutionStatus, Params, Playbook, PlaybookExecution, PlaybookStep,
        StepError, StepResult, StepStatus,
    },
    state::{
        ExecutionFilter, ExecutionStore, InMemoryExecutionStore,
        SledExecutionStore, StatusUpdate, StoreError,
    },
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn playbook(id: &str) -> Playbook {
    Playbook::new(
        id,
        "Storage test",
        vec![
            PlaybookStep::new("a", "ok"),
            PlaybookStep::new("b", "ok").depends_on(["a"]),
        ],
    )
}

fn success(step_id: &str, sequence: u64) -> StepResult {
    let mut result = StepResult::skipped(step_id, StepError::cancelled("unused"));
    result.status = StepStatus::Success;
    result.error = None;
    result.attempts = 1;
    result.output = json!({ "step": step_id });
    result.sequence = sequence;
    result
}

/// Test suite that runs against any ExecutionStore implementation
async fn test_store_operations(store: Arc<dyn ExecutionStore>) {
    // Create and read back
    let execution = PlaybookExecution::new(&playbook("pb"), "alert:1", Params::new());
    let id = execution.id;
    store.create_execution(&execution).await.unwrap();

    let loaded = store.get_execution(&id).await.unwrap();
    assert_eq!(loaded.id, id);
    assert_eq!(loaded.status, ExecutionStatus::Pending);
    assert_eq!(loaded.revision, 0);

    assert!(matches!(
        store.create_execution(&execution).await,
        Err(StoreError::Conflict(_))
    ));

    // Append-only step results
    store.append_step_result(&id, &success("a", 1)).await.unwrap();
    assert!(matches!(
        store.append_step_result(&id, &success("a", 2)).await,
        Err(StoreError::Conflict(_))
    ));
    let loaded = store.get_execution(&id).await.unwrap();
    assert_eq!(loaded.step_results.len(), 1);
    assert_eq!(loaded.result("a").unwrap().sequence, 1);

    // Status CAS guarded by revision
    let revision = store
        .compare_and_set_status(&id, 0, StatusUpdate::to(ExecutionStatus::Running))
        .await
        .unwrap();
    assert_eq!(revision, 1);
    assert!(matches!(
        store
            .compare_and_set_status(&id, 0, StatusUpdate::to(ExecutionStatus::Cancelled))
            .await,
        Err(StoreError::Conflict(_))
    ));

    store.append_step_result(&id, &success("b", 2)).await.unwrap();
    let revision = store
        .compare_and_set_status(
            &id,
            revision,
            StatusUpdate::to(ExecutionStatus::Failed).with_failure(ExecutionFailure::StepsFailed {
                steps: vec!["b".to_string()],
            }),
        )
        .await
        .unwrap();
    assert_eq!(revision, 2);

    // Terminal states are final
    assert!(matches!(
        store
            .compare_and_set_status(&id, revision, StatusUpdate::to(ExecutionStatus::Running))
            .await,
        Err(StoreError::Conflict(_))
    ));

    let loaded = store.get_execution(&id).await.unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert!(loaded.completed_at.is_some());
    assert_eq!(loaded.step_results.len(), 2);
    assert!(matches!(
        loaded.failure,
        Some(ExecutionFailure::StepsFailed { .. })
    ));

    // Unknown ids
    let missing = uuid::Uuid::now_v7();
    assert!(matches!(
        store.get_execution(&missing).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.append_step_result(&missing, &success("a", 1)).await,
        Err(StoreError::NotFound(_))
    ));
}

async fn test_filtering(store: Arc<dyn ExecutionStore>) {
    let mut ids = Vec::new();
    for playbook_id in ["alpha", "alpha", "beta"] {
        let execution = PlaybookExecution::new(&playbook(playbook_id), "test", Params::new());
        ids.push(execution.id);
        store.create_execution(&execution).await.unwrap();
    }
    store
        .compare_and_set_status(&ids[2], 0, StatusUpdate::to(ExecutionStatus::Running))
        .await
        .unwrap();

    let all = store
        .list_executions(&ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    // Newest first
    assert_eq!(all[0].id, ids[2]);
    assert_eq!(all[2].id, ids[0]);

    let alpha = store
        .list_executions(&ExecutionFilter {
            playbook_id: Some("alpha".to_string()),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(alpha.len(), 2);

    let running = store
        .list_executions(&ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].playbook_id, "beta");

    let limited = store
        .list_executions(&ExecutionFilter {
            limit: Some(1),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

async fn test_concurrent_appends(store: Arc<dyn ExecutionStore>) {
    let execution = PlaybookExecution::new(&playbook("race"), "test", Params::new());
    let id = execution.id;
    store.create_execution(&execution).await.unwrap();

    let mut handles = Vec::new();
    for sequence in 1..=8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.append_step_result(&id, &success("a", sequence)).await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(store.get_execution(&id).await.unwrap().step_results.len(), 1);
}

#[tokio::test]
async fn test_in_memory_store() {
    test_store_operations(Arc::new(InMemoryExecutionStore::new())).await;
    test_filtering(Arc::new(InMemoryExecutionStore::new())).await;
    test_concurrent_appends(Arc::new(InMemoryExecutionStore::new())).await;
}

#[tokio::test]
async fn test_sled_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledExecutionStore::new(dir.path().join("ops")).unwrap());
    test_store_operations(store).await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledExecutionStore::new(dir.path().join("filter")).unwrap());
    test_filtering(store).await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledExecutionStore::new(dir.path().join("race")).unwrap());
    test_concurrent_appends(store).await;
}
