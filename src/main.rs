use llm_playbook_engine::{
    api::{build_router, AppState},
    config::Config,
    playbooks::{
        create_default_registry, EventBus, ExecutionCoordinator, InMemoryPlaybookRepository,
        PlaybookService, StepRunner,
    },
    state::create_store,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        default_config()
    });

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "llm_playbook_engine={},tower_http=info",
            config.observability.log_level
        )
        .into()
    });
    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        "Starting {} v{}",
        config.observability.service_name,
        env!("CARGO_PKG_VERSION")
    );

    // Initialize Prometheus metrics
    if config.observability.prometheus_enabled {
        if let Err(e) = llm_playbook_engine::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
            tracing::warn!("Continuing without metrics");
        } else {
            tracing::info!("✅ Prometheus metrics initialized");
        }
    } else {
        tracing::info!("⚠️  Prometheus metrics disabled in configuration");
    }

    // Initialize storage backend
    tracing::info!("Storage backend: {:?}", config.state.backend);
    let store = create_store(&config.state)?;
    tracing::info!("✅ Storage backend initialized");

    // Action registry with built-in actions
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.server.request_timeout_secs))
        .build()?;
    let registry = Arc::new(create_default_registry(http_client));
    tracing::info!(actions = ?registry.actions(), "✅ Action registry initialized");

    // Playbook catalog
    let repository = Arc::new(InMemoryPlaybookRepository::new());
    if let Some(dir) = &config.engine.playbook_dir {
        match repository.load_dir(dir).await {
            Ok(count) => tracing::info!("✅ Loaded {} playbooks from {}", count, dir.display()),
            Err(e) => {
                tracing::error!("Failed to load playbooks from {}: {}", dir.display(), e);
                return Err(e.into());
            }
        }
    } else {
        tracing::info!("⚠️  No playbook directory configured, catalog starts empty");
    }

    // Execution engine
    let runner = StepRunner::new(registry, config.engine.retry.policy());
    let events = EventBus::new(config.engine.event_buffer_size);
    let coordinator = ExecutionCoordinator::new(
        store,
        runner,
        config.engine.worker_pool_size,
        events,
        config.engine.coordinator_config(),
    );
    let service = PlaybookService::new(repository, coordinator);
    tracing::info!(
        max_parallel_steps = config.engine.max_parallel_steps,
        worker_pool_size = config.engine.worker_pool_size,
        "✅ Playbook service initialized"
    );

    if config.engine.resume_on_startup {
        match service.resume_incomplete().await {
            Ok(0) => tracing::info!("No incomplete executions to resume"),
            Ok(count) => tracing::info!("✅ Resumed {} incomplete executions", count),
            Err(e) => tracing::error!("Failed to resume incomplete executions: {}", e),
        }
    }

    // Build HTTP router with REST API
    let app_state = AppState::new(service)
        .with_request_timeout(Duration::from_secs(config.server.request_timeout_secs));
    let app = build_router(app_state);

    // Start HTTP server
    let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;

    tracing::info!("🚀 HTTP API server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}/health", http_addr);
    tracing::info!("   REST API: http://{}/v1/playbooks", http_addr);
    tracing::info!("   Event stream: http://{}/v1/events", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shutting down gracefully...");
    Ok(())
}

fn default_config() -> Config {
    use llm_playbook_engine::config::*;

    Config {
        server: ServerConfig::default(),
        state: StateConfig {
            backend: StateBackend::Sled,
            path: Some("./data/executions".into()),
        },
        engine: EngineConfig::default(),
        observability: ObservabilityConfig::default(),
    }
}
