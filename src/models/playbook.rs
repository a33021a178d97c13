use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use strum::{Display, EnumString};
use validator::Validate;

/// Identifier of a step, unique within its playbook
pub type StepId = String;

/// Opaque key/value parameters handed to an action handler
pub type Params = serde_json::Map<String, JsonValue>;

/// Default per-attempt step timeout (5 minutes)
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Playbook defines an automated response workflow as a DAG of steps.
///
/// Playbooks are immutable snapshots: editing a playbook means publishing a new
/// `version` under the same `id`. Executions always pin the version they started with.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Playbook {
    #[validate(length(min = 1, max = 128))]
    pub id: String,

    #[validate(length(min = 1, max = 200))]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Monotonically increasing per playbook id
    #[validate(range(min = 1))]
    pub version: u32,

    #[serde(default)]
    pub status: PlaybookStatus,

    /// Trigger condition descriptor. Only the trigger subsystem interprets it.
    #[serde(default)]
    pub trigger: JsonValue,

    /// Steps in authoring order
    #[validate(nested)]
    pub steps: Vec<PlaybookStep>,

    /// Tags for organization
    #[serde(default)]
    pub tags: Vec<String>,

    /// Overall execution budget; takes precedence over the engine-wide setting
    #[serde(
        default,
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub wall_clock_timeout: Option<Duration>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Playbook {
    /// Create an active, version 1 playbook
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<PlaybookStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: 1,
            status: PlaybookStatus::Active,
            trigger: JsonValue::Null,
            steps,
            tags: Vec::new(),
            wall_clock_timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_status(mut self, status: PlaybookStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_wall_clock_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = Some(timeout);
        self
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&PlaybookStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether executions may be started from this playbook
    pub fn is_executable(&self) -> bool {
        matches!(self.status, PlaybookStatus::Active | PlaybookStatus::Testing)
    }
}

/// Lifecycle status of a playbook definition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlaybookStatus {
    #[default]
    Draft,
    Testing,
    Active,
    Deprecated,
}

/// A single node of the playbook graph
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaybookStep {
    #[validate(length(min = 1, max = 128))]
    pub id: StepId,

    #[serde(default)]
    pub name: String,

    /// Action registry key
    #[validate(length(min = 1))]
    pub action: String,

    #[serde(default)]
    pub params: Params,

    /// Per-attempt timeout
    #[serde(default = "default_step_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Re-attempts allowed after the first failure
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<StepId>,
}

impl PlaybookStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action: action.into(),
            params: Params::new(),
            timeout: DEFAULT_STEP_TIMEOUT,
            retries: 0,
            backoff: BackoffStrategy::default(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
    Fixed,
}

fn default_step_timeout() -> Duration {
    DEFAULT_STEP_TIMEOUT
}

/// Parse duration string (e.g., "250ms", "5s", "10m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".to_string());
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Missing duration unit: {}", s))?;
    let (num_str, unit) = s.split_at(split_at);
    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid duration number: {}", num_str))?;

    let secs = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(format!("Invalid duration unit: {}", unit)),
    }
}

/// Render a duration using the largest unit that represents it exactly
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for human readable step durations. Bare integers are seconds.
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    pub mod option {
        use super::Raw;
        use super::super::{format_duration, parse_duration};
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            d: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => serializer.serialize_str(&format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                None => Ok(None),
                Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
                Some(Raw::Text(text)) => parse_duration(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
