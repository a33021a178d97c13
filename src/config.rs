use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::playbooks::{CoordinatorConfig, RetryPolicy, StoreRetryPolicy};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// State backend configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Execution engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: LLM_PE_)
            .add_source(
                config::Environment::with_prefix("LLM_PE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document on top of the embedded defaults
    pub fn from_toml(content: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// State backend type
    #[serde(default)]
    pub backend: StateBackend,

    /// Path for the embedded database (sled)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Steps of a single execution allowed in flight at once
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Concurrent step workers across all executions
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Enforce a playbook-level wall-clock budget
    #[serde(default = "default_true")]
    pub wall_clock_enabled: bool,

    /// Fixed budget (seconds); derived from step timeouts and retries when unset
    pub wall_clock_timeout_secs: Option<u64>,

    #[serde(default)]
    pub store_retry: StoreRetryConfig,

    /// Capacity of the live event channel
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Directory of YAML/JSON playbooks loaded at startup
    pub playbook_dir: Option<PathBuf>,

    /// Re-drive pending and running executions found in the store at startup
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            worker_pool_size: default_worker_pool_size(),
            retry: RetryConfig::default(),
            wall_clock_enabled: true,
            wall_clock_timeout_secs: None,
            store_retry: StoreRetryConfig::default(),
            event_buffer_size: default_event_buffer_size(),
            playbook_dir: None,
            resume_on_startup: true,
        }
    }
}

impl EngineConfig {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_parallel_steps: self.max_parallel_steps,
            wall_clock_enabled: self.wall_clock_enabled,
            wall_clock_timeout: self.wall_clock_timeout_secs.map(Duration::from_secs),
            store_retry: self.store_retry.policy(),
        }
    }
}

/// Step retry backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random jitter as a fraction of the delay (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

/// Store write retry while the backend is unavailable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRetryConfig {
    #[serde(default = "default_store_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_store_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_store_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_store_max_attempts(),
            base_delay_ms: default_store_base_delay_ms(),
            max_delay_ms: default_store_max_delay_ms(),
        }
    }
}

impl StoreRetryConfig {
    pub fn policy(&self) -> StoreRetryPolicy {
        StoreRetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Service name
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
            prometheus_enabled: true,
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_parallel_steps() -> usize {
    8
}

fn default_worker_pool_size() -> usize {
    32
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_store_max_attempts() -> u32 {
    5
}

fn default_store_base_delay_ms() -> u64 {
    100
}

fn default_store_max_delay_ms() -> u64 {
    5000
}

fn default_event_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "llm-playbook-engine".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.engine.max_parallel_steps, 8);
        assert_eq!(config.engine.worker_pool_size, 32);
        assert!(config.engine.resume_on_startup);

        let policy = config.engine.retry.policy();
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_toml(
            r#"
[state]
backend = "sled"
path = "/var/lib/playbooks"

[engine]
max_parallel_steps = 2
wall_clock_timeout_secs = 600

[engine.store_retry]
max_attempts = 9
"#,
        )
        .unwrap();

        assert_eq!(config.state.backend, StateBackend::Sled);
        let coordinator = config.engine.coordinator_config();
        assert_eq!(coordinator.max_parallel_steps, 2);
        assert_eq!(coordinator.wall_clock_timeout, Some(Duration::from_secs(600)));
        assert_eq!(coordinator.store_retry.max_attempts, 9);
        assert_eq!(coordinator.store_retry.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_clamped() {
        let retry = RetryConfig {
            jitter_ratio: 4.0,
            ..RetryConfig::default()
        };
        assert_eq!(retry.policy().jitter_ratio, 1.0);
    }
}
