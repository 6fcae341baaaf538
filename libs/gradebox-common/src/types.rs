use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum accepted submission size
pub const MAX_CODE_BYTES: usize = 100 * 1024;

/// Default maximum score for every track
pub const DEFAULT_MAX_SCORE: f64 = 100.0;

/// Rule types the worker evaluates itself. Web rules are named checks
/// owned by the harness and may use any type.
pub const RULE_TYPES: &[&str] = &[
    "variable_exists",
    "value_check",
    "dataframe_shape",
    "row_count",
    "column_exists",
    "value_in_result",
    "custom_check",
    "output_contains",
    "resource_exists",
    "aws_resource_exists",
    "image_exists",
    "container_running",
    "port_accessible",
];

/// Challenge category. Selects the runner and container image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Track {
    Web,
    Data,
    Cloud,
}

impl Track {
    pub const ALL: [Track; 3] = [Track::Web, Track::Data, Track::Cloud];
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::Web => write!(f, "web"),
            Track::Data => write!(f, "data"),
            Track::Cloud => write!(f, "cloud"),
        }
    }
}

impl FromStr for Track {
    type Err = String;

    /// Accepts the short names and the catalogue labels persisted by the
    /// content side ("Web Development", "Data Analysis", "Cloud Infrastructure").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "web" | "web development" => Ok(Track::Web),
            "data" | "data analysis" => Ok(Track::Data),
            "cloud" | "cloud infrastructure" => Ok(Track::Cloud),
            other => Err(format!("Unknown track: '{}'", other)),
        }
    }
}

impl TryFrom<String> for Track {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A submission to grade. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub challenge_id: String,
    pub user_id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Overrides the stored challenge configuration for this request only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_config: Option<ChallengeSpec>,
}

/// Queue envelope around an [`ExecutionRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedExecution {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub request: ExecutionRequest,
}

impl QueuedExecution {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            request,
        }
    }
}

/// One declarative check. `rule_type` is the discriminator, every other
/// key is a type-specific parameter interpreted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ValidationRule {
    pub fn new(name: impl Into<String>, rule_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type: rule_type.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Track-specific setup: Python for data challenges, a command list for
/// cloud CLI challenges, passed through untouched for web challenges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setup {
    Script(String),
    Commands(Vec<String>),
}

impl Setup {
    pub fn as_script(&self) -> String {
        match self {
            Setup::Script(script) => script.clone(),
            Setup::Commands(lines) => lines.join("\n"),
        }
    }
}

/// How a submitted Docker image is started for container/port checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRunSpec {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// The `validation_rules` document stored with a challenge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Setup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, alias = "rules")]
    pub validations: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<ContainerRunSpec>,
}

impl ChallengeSpec {
    /// Apply a per-request override. Fields set on `other` win; the rule
    /// list is replaced only when the override carries rules.
    pub fn overlay(mut self, other: ChallengeSpec) -> ChallengeSpec {
        if other.kind.is_some() {
            self.kind = other.kind;
        }
        if other.dataset.is_some() {
            self.dataset = other.dataset;
        }
        if other.setup.is_some() {
            self.setup = other.setup;
        }
        if other.timeout_seconds.is_some() {
            self.timeout_seconds = other.timeout_seconds;
        }
        if !other.validations.is_empty() {
            self.validations = other.validations;
        }
        if other.run.is_some() {
            self.run = other.run;
        }
        self
    }

    /// Rule names must be present and unique within a challenge
    pub fn check_rule_names(&self) -> Result<(), ChallengeError> {
        let mut seen = HashSet::new();
        for rule in &self.validations {
            if rule.name.trim().is_empty() {
                return Err(ChallengeError::UnnamedRule(rule.rule_type.clone()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(ChallengeError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(())
    }
}

/// Challenge as read from the content store. Read-only to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub track: Track,
    pub validation_rules: ChallengeSpec,
}

impl Challenge {
    pub fn validate(&self) -> Result<(), ChallengeError> {
        self.validation_rules.check_rule_names()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChallengeError {
    #[error("validation rule of type '{0}' has no name")]
    UnnamedRule(String),
    #[error("validation rule name '{0}' is used more than once")]
    DuplicateRule(String),
}

/// Result of one validation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl ValidationOutcome {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// One CLI invocation made during a cloud CLI challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub exit_code: Option<i64>,
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandRecord {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Cloud-track extras attached to a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudSummary {
    pub mode: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroyed: Option<bool>,
}

/// The single artifact returned for every execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub challenge_id: String,
    pub user_id: String,
    pub track_type: Option<Track>,
    pub status: ExecutionStatus,
    pub success: bool,
    pub score: f64,
    pub max_score: f64,
    pub execution_time_ms: u64,
    pub output: String,
    pub errors: Vec<String>,
    pub validation_results: Vec<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights_found: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudSummary>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// A zero-score result carrying only errors
    pub fn failure(
        request: &ExecutionRequest,
        track: Option<Track>,
        status: ExecutionStatus,
        errors: Vec<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            challenge_id: request.challenge_id.clone(),
            user_id: request.user_id.clone(),
            track_type: track,
            status,
            success: false,
            score: 0.0,
            max_score: DEFAULT_MAX_SCORE,
            execution_time_ms,
            output: String::new(),
            errors,
            validation_results: Vec::new(),
            insights_found: None,
            cloud: None,
            completed_at: Utc::now(),
        }
    }

    pub fn passed_count(&self) -> usize {
        self.validation_results.iter().filter(|v| v.passed).count()
    }
}
