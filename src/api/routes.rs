use crate::api::{handlers, AppState};
use crate::metrics::track_http;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Build the main API router
pub fn build_router(state: AppState) -> Router {
    let request_timeout = state.request_timeout;

    let api = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::health_check))
        .route("/health/ready", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        // Playbook catalog
        .route(
            "/v1/playbooks",
            get(handlers::list_playbooks).post(handlers::publish_playbook),
        )
        .route("/v1/playbooks/validate", post(handlers::validate_playbook))
        .route("/v1/playbooks/:id", get(handlers::get_playbook))
        .route(
            "/v1/playbooks/:id/versions/:version",
            get(handlers::get_playbook_version),
        )
        // Executions
        .route(
            "/v1/executions",
            get(handlers::list_executions).post(handlers::start_execution),
        )
        .route("/v1/executions/:id", get(handlers::get_execution))
        .route("/v1/executions/:id/cancel", post(handlers::cancel_execution))
        .layer(TimeoutLayer::new(request_timeout));

    // Event stream is long-lived and stays outside the request timeout
    let events = Router::new().route("/v1/events", get(handlers::stream_events));

    api.merge(events)
        .route_layer(middleware::from_fn(track_http))
        // Add state
        .with_state(state)
        // Add middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
}
