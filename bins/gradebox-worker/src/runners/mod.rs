/// Track runners and the track → runner registry
///
/// **Responsibility:**
/// A runner prepares one track's container input, drives the Container
/// Lifecycle Manager, interprets the track's output contract and hands the
/// Validation Engine the right context.
///
/// Runners are built once at startup and shared across concurrent runs.

pub mod cloud;
pub mod data;
pub mod web;

use crate::config::TrackConfigManager;
use crate::engine::{ContainerRuntime, RawRunResult};
use crate::error::ExecutionError;
use crate::lifecycle::RunLifecycle;
use crate::scoring::Score;
use anyhow::Result;
use async_trait::async_trait;
use gradebox_common::types::{
    ChallengeSpec, CloudSummary, ExecutionRequest, Track, ValidationOutcome, ValidationRule,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lines of container output quoted in error messages
const ERROR_TAIL_LINES: usize = 20;

/// Longest budget a deadline will track
const MAX_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

/// One submission as seen by a runner
#[derive(Debug, Clone)]
pub struct RunJob<'a> {
    pub run_id: Uuid,
    pub request: &'a ExecutionRequest,
    /// Stored challenge with the request's overrides applied
    pub spec: &'a ChallengeSpec,
    pub timeout: Duration,
}

/// What a runner hands back to the Execution Service
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub validation_results: Vec<ValidationOutcome>,
    pub score: Score,
    pub output: String,
    pub errors: Vec<String>,
    pub cloud: Option<CloudSummary>,
}

#[async_trait]
pub trait TrackRunner: Send + Sync {
    fn track(&self) -> Track;

    /// Image whose presence decides this runner's health
    fn image(&self) -> &str;

    async fn run(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError>;
}

/// Closed mapping from track to runner
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<Track, Arc<dyn TrackRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn TrackRunner>) {
        self.runners.insert(runner.track(), runner);
    }

    /// Web, data and cloud runners over one shared runtime
    pub fn standard(runtime: Arc<dyn ContainerRuntime>, config: &TrackConfigManager) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(web::WebRunner::new(
            runtime.clone(),
            config.get_config(Track::Web)?.clone(),
        )));
        registry.register(Arc::new(data::DataRunner::new(
            runtime.clone(),
            config.get_config(Track::Data)?.clone(),
            config.data().clone(),
        )));
        registry.register(Arc::new(cloud::CloudRunner::new(
            runtime,
            config.get_config(Track::Cloud)?.clone(),
            config.cloud().clone(),
        )));
        Ok(registry)
    }

    pub fn get(&self, track: Track) -> Result<Arc<dyn TrackRunner>, ExecutionError> {
        self.runners
            .get(&track)
            .cloned()
            .ok_or_else(|| ExecutionError::Configuration(format!("No runner registered for track '{}'", track)))
    }

    pub fn runners(&self) -> Vec<Arc<dyn TrackRunner>> {
        let mut runners: Vec<_> = self.runners.values().cloned().collect();
        runners.sort_by_key(|r| r.track().to_string());
        runners
    }
}

/// Wall-clock budget shared by the phases of one run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        let budget = budget.min(MAX_BUDGET);
        Self {
            end: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn timeout_error(&self) -> ExecutionError {
        ExecutionError::Timeout {
            seconds: self.budget.as_secs(),
        }
    }
}

/// Last lines of a log, for error messages
pub(crate) fn tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Error for a run whose result channel could not be read
pub(crate) fn classify_failure(raw: &RawRunResult, parse_error: ExecutionError) -> ExecutionError {
    if raw.oom_killed {
        return ExecutionError::ContainerRuntime {
            exit_code: raw.exit_code,
            message: "killed: out of memory".to_string(),
        };
    }
    match raw.exit_code {
        Some(0) => parse_error,
        code => ExecutionError::ContainerRuntime {
            exit_code: code,
            message: tail(&raw.log, ERROR_TAIL_LINES),
        },
    }
}

/// One failed outcome per rule, all with the same reason
pub(crate) fn all_failed(rules: &[ValidationRule], reason: &str) -> Vec<ValidationOutcome> {
    rules
        .iter()
        .map(|rule| ValidationOutcome::fail(&rule.name, reason))
        .collect()
}
