use crate::api::AppState;
use crate::error::Result;
use crate::models::*;
use crate::playbooks::{EventStats, ExecutionEvent, ValidationReport};
use crate::state::ExecutionFilter;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use uuid::Uuid;
use validator::Validate;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_executions: state.service.active_count(),
        store_backend: state.service.coordinator().store().backend().to_string(),
        events: state.service.event_stats(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_executions: usize,
    pub store_backend: String,
    pub events: EventStats,
}

/// Prometheus metrics endpoint
///
/// Returns metrics in Prometheus text exposition format
pub async fn metrics() -> (StatusCode, String) {
    let metrics = crate::metrics::gather_metrics();
    (StatusCode::OK, metrics)
}

// ============================================================================
// Playbooks
// ============================================================================

/// Publish a new playbook version
pub async fn publish_playbook(
    State(state): State<AppState>,
    Json(playbook): Json<Playbook>,
) -> Result<(StatusCode, Json<Playbook>)> {
    let published = state.service.publish_playbook(playbook).await?;
    Ok((StatusCode::CREATED, Json(published.as_ref().clone())))
}

/// Latest version of every playbook
pub async fn list_playbooks(
    State(state): State<AppState>,
) -> Result<Json<ListPlaybooksResponse>> {
    let playbooks: Vec<PlaybookSummary> = state
        .service
        .list_playbooks()
        .await?
        .iter()
        .map(|playbook| PlaybookSummary::from(playbook.as_ref()))
        .collect();

    Ok(Json(ListPlaybooksResponse {
        total: playbooks.len(),
        playbooks,
    }))
}

pub async fn get_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Playbook>> {
    let playbook = state.service.get_playbook(&id, None).await?;
    Ok(Json(playbook.as_ref().clone()))
}

pub async fn get_playbook_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> Result<Json<Playbook>> {
    let playbook = state.service.get_playbook(&id, Some(version)).await?;
    Ok(Json(playbook.as_ref().clone()))
}

/// Dry-run validation returning the dispatch layers
pub async fn validate_playbook(
    State(state): State<AppState>,
    Json(playbook): Json<Playbook>,
) -> Result<Json<ValidationReport>> {
    let report = state.service.validate_playbook(&playbook)?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct PlaybookSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub status: PlaybookStatus,
    pub steps: usize,
    pub tags: Vec<String>,
}

impl From<&Playbook> for PlaybookSummary {
    fn from(playbook: &Playbook) -> Self {
        Self {
            id: playbook.id.clone(),
            name: playbook.name.clone(),
            version: playbook.version,
            status: playbook.status,
            steps: playbook.steps.len(),
            tags: playbook.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListPlaybooksResponse {
    pub playbooks: Vec<PlaybookSummary>,
    pub total: usize,
}

// ============================================================================
// Executions
// ============================================================================

/// Start an execution; it is driven in the background
pub async fn start_execution(
    State(state): State<AppState>,
    Json(request): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<StartExecutionResponse>)> {
    request.validate()?;

    let execution_id = state
        .service
        .start_execution(
            &request.playbook_id,
            request.version,
            &request.triggered_by,
            request.params,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartExecutionResponse {
            execution_id,
            status: ExecutionStatus::Pending,
        }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartExecutionRequest {
    #[validate(length(min = 1))]
    pub playbook_id: String,

    /// Latest version when omitted
    pub version: Option<u32>,

    #[serde(default = "default_triggered_by")]
    #[validate(length(min = 1))]
    pub triggered_by: String,

    #[serde(default)]
    pub params: Params,
}

fn default_triggered_by() -> String {
    "api".to_string()
}

#[derive(Debug, Serialize)]
pub struct StartExecutionResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PlaybookExecution>> {
    let execution = state.service.get_execution(&id).await?;
    Ok(Json(execution))
}

/// List executions, newest first
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListExecutionsQuery>,
) -> Result<Json<ListExecutionsResponse>> {
    let filter = ExecutionFilter {
        playbook_id: params.playbook_id,
        status: params.status,
        limit: Some(params.limit.unwrap_or(50).min(500)), // Max 500 per request
    };

    let executions = state.service.list_executions(&filter).await?;

    Ok(Json(ListExecutionsResponse {
        total: executions.len(),
        executions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub playbook_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<PlaybookExecution>,
    pub total: usize,
}

/// Request cancellation. Repeated calls and terminal executions are no-ops.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<PlaybookExecution>)> {
    state.service.cancel_execution(&id).await?;
    let execution = state.service.get_execution(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub execution_id: Option<Uuid>,
}

/// Server-sent execution events, optionally narrowed to one execution
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let filter = query.execution_id;

    let stream = BroadcastStream::new(state.service.subscribe()).filter_map(move |item| {
        match item {
            Ok(event) if filter.map_or(true, |id| id == event.execution_id) => {
                to_sse_event(&event).map(Ok)
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed = missed, "Event subscriber lagged");
                Some(Ok(Event::default().event("lagged").data(missed.to_string())))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &ExecutionEvent) -> Option<Event> {
    match Event::default().event(event.kind.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode execution event");
            None
        }
    }
}
