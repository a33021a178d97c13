mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use common::harness;
use llm_playbook_engine::{
    api::{build_router, AppState},
    models::ExecutionStatus,
    playbooks::PlaybookService,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn app() -> (Router, PlaybookService) {
    let h = harness();
    let service = h.service.clone();
    (build_router(AppState::new(h.service)), service)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn containment_playbook(version: u32) -> Value {
    json!({
        "id": "containment",
        "name": "Containment",
        "version": version,
        "status": "active",
        "steps": [
            { "id": "triage", "action": "ok" },
            { "id": "isolate", "action": "ok", "depends_on": ["triage"], "timeout": "30s" },
            { "id": "notify", "action": "echo", "depends_on": ["triage"],
              "params": { "text": "{{host}} isolated" } }
        ]
    })
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["active_executions"], 0);
    assert_eq!(body["events"]["published"], 0);
    assert_eq!(body["events"]["capacity"], 256);
}

#[tokio::test]
async fn test_playbook_catalog() {
    let (app, _) = app();

    let (status, body) = send(&app, Method::POST, "/v1/playbooks", Some(containment_playbook(1))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["version"], 1);
    assert_eq!(body["steps"][1]["timeout"], "30s");

    let (status, _) = send(&app, Method::POST, "/v1/playbooks", Some(containment_playbook(2))).await;
    assert_eq!(status, StatusCode::CREATED);

    // Versions must increase
    let (status, body) = send(&app, Method::POST, "/v1/playbooks", Some(containment_playbook(2))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, body) = send(&app, Method::GET, "/v1/playbooks/containment", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);

    let (status, body) = send(&app, Method::GET, "/v1/playbooks/containment/versions/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);

    let (status, body) = send(&app, Method::GET, "/v1/playbooks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["playbooks"][0]["steps"], 3);

    let (status, body) = send(&app, Method::GET, "/v1/playbooks/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_validate_endpoint() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/playbooks/validate",
        Some(containment_playbook(1)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["layers"], json!([["triage"], ["isolate", "notify"]]));
    assert_eq!(body["unknown_actions"], json!([]));

    let cyclic = json!({
        "id": "loop",
        "name": "Loop",
        "version": 1,
        "steps": [
            { "id": "a", "action": "ok", "depends_on": ["b"] },
            { "id": "b", "action": "ok", "depends_on": ["a"] }
        ]
    });
    let (status, body) = send(&app, Method::POST, "/v1/playbooks/validate", Some(cyclic)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_PLAYBOOK_GRAPH");
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let (app, service) = app();
    send(&app, Method::POST, "/v1/playbooks", Some(containment_playbook(1))).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/executions",
        Some(json!({
            "playbook_id": "containment",
            "params": { "host": "web-7" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");

    let id: Uuid = body["execution_id"].as_str().unwrap().parse().unwrap();
    let finished = service.wait_for_completion(&id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Succeeded);

    let (status, body) = send(&app, Method::GET, &format!("/v1/executions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["triggered_by"], "api");
    assert_eq!(body["step_results"]["notify"]["output"]["text"], "web-7 isolated");

    let (status, body) = send(
        &app,
        Method::GET,
        "/v1/executions?playbook_id=containment&status=succeeded",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    // Cancelling a finished execution changes nothing
    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/v1/executions/{}/cancel", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "succeeded");
}

#[tokio::test]
async fn test_execution_errors() {
    let (app, _) = app();

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/v1/executions/{}", Uuid::now_v7()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/executions",
        Some(json!({ "playbook_id": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/executions",
        Some(json!({ "playbook_id": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    llm_playbook_engine::metrics::init_metrics().unwrap();
    let (app, _) = app();

    // Populate the HTTP counters
    send(&app, Method::GET, "/health", None).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("llm_playbook_engine_http_requests_total"));
    assert!(text.contains("llm_playbook_engine_build_info"));
}
