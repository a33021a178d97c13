pub mod actions;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod graph;
pub mod repository;
pub mod runner;
pub mod service;

pub use actions::{
    create_default_registry, ActionContext, ActionError, ActionHandler, ActionRegistry,
    FnHandler, ParamKind, ParamSchema, ParamSpec,
};
pub use context::TemplateContext;
pub use coordinator::{with_store_retry, CoordinatorConfig, ExecutionCoordinator, StoreRetryPolicy};
pub use events::{EventBus, EventKind, EventStats, ExecutionEvent};
pub use graph::{topological_layers, validate, verify_layers, DependencyGraph, GraphError};
pub use repository::{validate_definition, InMemoryPlaybookRepository, PlaybookRepository};
pub use runner::{RetryPolicy, StepRunner, StepScope};
pub use service::{PlaybookService, ValidationReport};
