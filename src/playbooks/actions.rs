use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::models::{Params, StepError, StepErrorKind, StepId};

/// Failures surfaced by action lookup, parameter checks and handlers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// No handler registered under the step's action key
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// Parameters do not match the action's declared schema
    #[error("invalid params for action '{action}': {message}")]
    InvalidParams { action: String, message: String },

    /// The handler ran and reported a failure; assumed transient
    #[error("{0}")]
    HandlerFailure(String),
}

impl ActionError {
    pub fn failure(message: impl Into<String>) -> Self {
        ActionError::HandlerFailure(message.into())
    }

    /// Configuration faults are never retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::HandlerFailure(_))
    }

    pub fn kind(&self) -> StepErrorKind {
        match self {
            ActionError::UnknownAction(_) => StepErrorKind::UnknownAction,
            ActionError::InvalidParams { .. } => StepErrorKind::InvalidParams,
            ActionError::HandlerFailure(_) => StepErrorKind::HandlerFailure,
        }
    }
}

impl From<ActionError> for StepError {
    fn from(err: ActionError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

/// Per-invocation context handed to action handlers
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: Uuid,
    pub playbook_id: String,
    pub step_id: StepId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Fires when the execution is cancelled; cooperative handlers should stop early
    pub cancellation: CancellationToken,
}

impl ActionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A pluggable step action.
///
/// Handlers are the only code that talks to external systems. They may be invoked
/// more than once for the same step when retries are configured.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError>;

    /// Declared parameter schema, checked before every dispatch
    fn schema(&self) -> ParamSchema {
        ParamSchema::default()
    }
}

/// Adapter that turns an async closure into an [`ActionHandler`]
pub struct FnHandler<F> {
    f: F,
    schema: ParamSchema,
}

impl<F> FnHandler<F> {
    pub fn new(schema: ParamSchema, f: F) -> Self {
        Self { f, schema }
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, ActionError>> + Send + 'static,
{
    async fn invoke(&self, ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError> {
        (self.f)(ctx.clone(), params.clone()).await
    }

    fn schema(&self) -> ParamSchema {
        self.schema.clone()
    }
}

/// JSON type expected for a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamKind {
    fn matches(&self, value: &JsonValue) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
            ParamKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// Declared parameters of an action. Undeclared keys are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Check `params` against the declared specs
    pub fn validate(&self, params: &Params) -> Result<(), String> {
        for spec in &self.params {
            match params.get(&spec.name) {
                None | Some(JsonValue::Null) if spec.required => {
                    return Err(format!("'{}' parameter required", spec.name));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(format!("'{}' must be of type {}", spec.name, spec.kind));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Registry of action handlers, keyed by action identifier.
///
/// Populated once at startup and shared read-only (behind an `Arc`) by every
/// execution afterwards.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under an action key, replacing any previous one
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, action: impl Into<String>, schema: ParamSchema, f: F)
    where
        F: Fn(ActionContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ActionError>> + Send + 'static,
    {
        self.register(action, Arc::new(FnHandler::new(schema, f)));
    }

    /// Look up the handler for an action key
    pub fn get(&self, action: &str) -> Result<Arc<dyn ActionHandler>, ActionError> {
        self.handlers
            .get(action)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action keys, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Create the registry with the built-in generic actions
pub fn create_default_registry(client: Client) -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.register("wait", Arc::new(WaitAction));
    registry.register("log", Arc::new(LogAction));
    registry.register("http_request", Arc::new(HttpRequestAction::new(client.clone())));
    registry.register("webhook", Arc::new(WebhookAction::new(client)));

    registry
}

// ==================== Workflow Control ====================

/// Sleeps for `duration` seconds (or `duration_ms`), stopping early on cancellation
struct WaitAction;

#[async_trait]
impl ActionHandler for WaitAction {
    async fn invoke(&self, ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError> {
        let duration = match params.get("duration_ms").and_then(|v| v.as_u64()) {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(params.get("duration").and_then(|v| v.as_u64()).unwrap_or(5)),
        };

        info!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            duration_ms = duration.as_millis() as u64,
            "Waiting"
        );

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.cancellation.cancelled() => {
                return Err(ActionError::failure("wait interrupted by cancellation"));
            }
        }

        Ok(json!({ "waited_ms": duration.as_millis() as u64 }))
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::new()
            .optional("duration", ParamKind::Integer)
            .optional("duration_ms", ParamKind::Integer)
    }
}

/// Emits a structured log record; useful as an audit marker inside playbooks
struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn invoke(&self, ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        info!(
            execution_id = %ctx.execution_id,
            playbook_id = %ctx.playbook_id,
            step_id = %ctx.step_id,
            message = %message,
            "Playbook log"
        );

        Ok(json!({ "logged": message }))
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::new().required("message", ParamKind::String)
    }
}

// ==================== Generic HTTP ====================

struct HttpRequestAction {
    client: Client,
}

impl HttpRequestAction {
    fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for HttpRequestAction {
    async fn invoke(&self, _ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActionError::failure("'url' parameter required"))?;

        let method_name = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            ActionError::InvalidParams {
                action: "http_request".to_string(),
                message: format!("unsupported method '{}'", method_name),
            }
        })?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::failure(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<JsonValue>(&text).unwrap_or(JsonValue::String(text));

        if !status.is_success() {
            return Err(ActionError::failure(format!(
                "HTTP request returned non-success status {}",
                status
            )));
        }

        Ok(json!({
            "status_code": status.as_u16(),
            "body": body,
        }))
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::new()
            .required("url", ParamKind::String)
            .optional("method", ParamKind::String)
            .optional("headers", ParamKind::Object)
    }
}

/// POSTs `payload` together with the execution coordinates as JSON
struct WebhookAction {
    client: Client,
}

impl WebhookAction {
    fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for WebhookAction {
    async fn invoke(&self, ctx: &ActionContext, params: &Params) -> Result<JsonValue, ActionError> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActionError::failure("'url' parameter required"))?;

        let payload = json!({
            "execution_id": ctx.execution_id,
            "playbook_id": ctx.playbook_id,
            "step_id": ctx.step_id,
            "attempt": ctx.attempt,
            "payload": params.get("payload").cloned().unwrap_or_else(|| json!({})),
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();

                if status.is_success() {
                    Ok(json!({
                        "status_code": status.as_u16(),
                        "response_body": body,
                    }))
                } else {
                    Err(ActionError::failure(format!(
                        "Webhook returned non-success status {}: {}",
                        status, body
                    )))
                }
            }
            Err(e) => Err(ActionError::failure(format!("Webhook request failed: {}", e))),
        }
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::new()
            .required("url", ParamKind::String)
            .optional("payload", ParamKind::Any)
    }
}
