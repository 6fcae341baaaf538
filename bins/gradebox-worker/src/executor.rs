/// Execution Service - the one entry point for grading a submission
///
/// **Responsibility:**
/// Look up the challenge, pick the track runner, bound the run with its
/// timeout and fold every outcome into a well-formed `ExecutionResult`.
///
/// Nothing escapes `execute()`: launch failures, timeouts, parse errors and
/// unknown challenges all come back as `success = false` results.

use crate::challenges::ChallengeSource;
use crate::config::{TrackConfig, TrackConfigManager};
use crate::engine::{ContainerRuntime, RuntimeHealth};
use crate::error::ExecutionError;
use crate::lifecycle::RunLifecycle;
use crate::metrics;
use crate::runners::{RunJob, RunnerRegistry};
use chrono::Utc;
use gradebox_common::types::{
    ChallengeSpec, ExecutionRequest, ExecutionResult, ExecutionStatus, Track, MAX_CODE_BYTES,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Upper bound on a health query per track
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ExecutionService {
    challenges: Arc<dyn ChallengeSource>,
    registry: RunnerRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<TrackConfigManager>,
}

impl ExecutionService {
    pub fn new(
        challenges: Arc<dyn ChallengeSource>,
        registry: RunnerRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<TrackConfigManager>,
    ) -> Self {
        Self {
            challenges,
            registry,
            runtime,
            config,
        }
    }

    /// Grade one submission. Never fails.
    #[instrument(skip(self, request), fields(run_id = %run_id, challenge_id = %request.challenge_id))]
    pub async fn execute(&self, run_id: Uuid, request: &ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();

        let (track, result) = match self.lookup(request).await {
            Ok((track, spec, ceiling)) => (
                Some(track),
                self.run(run_id, request, track, spec, ceiling, start).await,
            ),
            Err(e) => {
                warn!(error = %e, "Rejected before execution");
                (
                    None,
                    ExecutionResult::failure(
                        request,
                        None,
                        e.status(),
                        vec![e.to_string()],
                        elapsed_ms(start),
                    ),
                )
            }
        };

        let track_label = track.map_or_else(|| "unknown".to_string(), |t| t.to_string());
        let status_label = result.status.to_string();
        metrics::record_execution(&track_label, &status_label, start.elapsed().as_secs_f64());

        info!(
            track = %track_label,
            status = %status_label,
            success = result.success,
            score = result.score,
            passed = result.passed_count(),
            rules = result.validation_results.len(),
            execution_ms = result.execution_time_ms,
            "Execution finished"
        );
        result
    }

    /// Resolve the challenge and the effective configuration for this request,
    /// along with the challenge's own timeout
    async fn lookup(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(Track, ChallengeSpec, Option<u64>), ExecutionError> {
        let challenge = self
            .challenges
            .challenge(&request.challenge_id)
            .await
            .map_err(|e| ExecutionError::Configuration(format!("{:#}", e)))?
            .ok_or_else(|| {
                ExecutionError::Configuration(format!("Unknown challenge '{}'", request.challenge_id))
            })?;

        let mut spec = challenge.validation_rules;
        let ceiling = spec.timeout_seconds;
        if let Some(overlay) = &request.test_config {
            spec = spec.overlay(overlay.clone());
            spec.check_rule_names()
                .map_err(|e| ExecutionError::Configuration(format!("test_config: {}", e)))?;
        }
        Ok((challenge.track, spec, ceiling))
    }

    async fn run(
        &self,
        run_id: Uuid,
        request: &ExecutionRequest,
        track: Track,
        spec: ChallengeSpec,
        ceiling: Option<u64>,
        start: Instant,
    ) -> ExecutionResult {
        let fail = |e: ExecutionError| {
            ExecutionResult::failure(request, Some(track), e.status(), vec![e.to_string()], elapsed_ms(start))
        };

        if request.code.len() > MAX_CODE_BYTES {
            return fail(ExecutionError::Configuration(format!(
                "Submission is {} bytes; the limit is {} bytes",
                request.code.len(),
                MAX_CODE_BYTES
            )));
        }

        let runner = match self.registry.get(track) {
            Ok(runner) => runner,
            Err(e) => return fail(e),
        };
        let timeout = match self.config.get_config(track) {
            Ok(config) => effective_timeout(ceiling, spec.timeout_seconds, config),
            Err(e) => return fail(ExecutionError::Configuration(e.to_string())),
        };
        if spec.timeout_seconds.map_or(false, |s| s != timeout.as_secs()) {
            debug!(
                requested = ?spec.timeout_seconds,
                effective = timeout.as_secs(),
                "Timeout clamped"
            );
        }

        let job = RunJob {
            run_id,
            request,
            spec: &spec,
            timeout,
        };
        let mut lifecycle = RunLifecycle::new(run_id);
        let outcome = runner.run(&job, &mut lifecycle).await;

        self.check_leftovers(&run_id).await;

        match outcome {
            Ok(outcome) => {
                let terminal = lifecycle.finish(outcome.score.success);
                debug!(state = %terminal, history = ?lifecycle.history(), "Run closed");
                ExecutionResult {
                    challenge_id: request.challenge_id.clone(),
                    user_id: request.user_id.clone(),
                    track_type: Some(track),
                    status: ExecutionStatus::Completed,
                    success: outcome.score.success,
                    score: outcome.score.score,
                    max_score: outcome.score.max_score,
                    execution_time_ms: elapsed_ms(start),
                    output: outcome.output,
                    errors: outcome.errors,
                    validation_results: outcome.validation_results,
                    insights_found: outcome.score.insights,
                    cloud: outcome.cloud,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => {
                let terminal = lifecycle.finish(false);
                warn!(error = %e, kind = e.kind().as_str(), state = %terminal, "Run failed");
                let mut result = fail(e);
                result
                    .errors
                    .extend(lifecycle.warnings().iter().map(|w| w.to_string()));
                result
            }
        }
    }

    /// Every container of a run must be gone once its runner returns
    async fn check_leftovers(&self, run_id: &Uuid) {
        match self.runtime.leftover_containers(run_id).await {
            Ok(leftovers) if leftovers.is_empty() => {}
            Ok(leftovers) => {
                error!(containers = ?leftovers, "Containers left behind after run");
            }
            Err(e) => debug!(error = %e, "Leftover check skipped"),
        }
    }

    /// Per-track runner health: runtime reachable and image present
    pub async fn status(&self) -> BTreeMap<String, RuntimeHealth> {
        let mut report = BTreeMap::new();
        for runner in self.registry.runners() {
            let health = match tokio::time::timeout(HEALTH_TIMEOUT, self.runtime.health(runner.image())).await {
                Ok(health) => health,
                Err(_) => RuntimeHealth {
                    runtime_reachable: false,
                    image_present: false,
                    detail: Some("health check timed out".to_string()),
                },
            };
            report.insert(runner.track().to_string(), health);
        }
        report
    }
}

/// A request may shorten the challenge's timeout but never extend it, and
/// nothing runs longer than the track's ceiling
fn effective_timeout(challenge: Option<u64>, requested: Option<u64>, config: &TrackConfig) -> Duration {
    let allowed = challenge
        .unwrap_or(config.default_timeout_seconds)
        .min(config.max_timeout_seconds);
    let seconds = requested.map_or(allowed, |s| s.min(allowed));
    Duration::from_secs(seconds.max(1))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::StaticChallenges;
    use crate::fake_runtime::{exited, timed_out, FakeRuntime};
    use crate::protocol::frame_result;
    use crate::runners::test_support::{request, rule};
    use gradebox_common::types::{Challenge, ValidationRule};
    use serde_json::json;

    fn challenge(id: &str, track: Track, kind: Option<&str>, validations: Vec<ValidationRule>) -> Challenge {
        Challenge {
            id: id.to_string(),
            track,
            validation_rules: ChallengeSpec {
                kind: kind.map(str::to_string),
                validations,
                ..Default::default()
            },
        }
    }

    fn catalogue() -> Vec<Challenge> {
        vec![
            challenge(
                "revenue",
                Track::Data,
                None,
                vec![rule("revenue_exists", "variable_exists", json!({"variable": "total_revenue"}))],
            ),
            challenge(
                "hello-page",
                Track::Web,
                None,
                vec![ValidationRule::new("has_heading", "element_exists")],
            ),
            challenge("no-subtype", Track::Cloud, None, vec![]),
            challenge("bucket-tf", Track::Cloud, Some("terraform"), vec![]),
            Challenge {
                validation_rules: ChallengeSpec {
                    timeout_seconds: Some(10_000),
                    ..Default::default()
                },
                ..challenge("long-data", Track::Data, None, vec![])
            },
        ]
    }

    fn service(runtime: Arc<FakeRuntime>) -> ExecutionService {
        let config = Arc::new(TrackConfigManager::built_in());
        let registry = RunnerRegistry::standard(runtime.clone(), &config).unwrap();
        let challenges = Arc::new(StaticChallenges::new(catalogue()).unwrap());
        ExecutionService::new(challenges, registry, runtime, config)
    }

    fn data_report() -> String {
        let report = json!({
            "variables": {
                "df": {"type": "DataFrame", "shape": [3, 2], "columns": ["a", "b"], "length": 3},
                "total_revenue": {"type": "float64", "value": 42.0}
            },
            "checks": {},
            "error": null
        });
        frame_result(&report.to_string())
    }

    fn submission(challenge_id: &str, code: &str) -> ExecutionRequest {
        ExecutionRequest {
            challenge_id: challenge_id.to_string(),
            ..request(code)
        }
    }

    #[tokio::test]
    async fn test_data_submission_completes() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(exited(0, &data_report()))));
        let service = service(runtime.clone());
        let run_id = Uuid::new_v4();

        let result = service
            .execute(run_id, &submission("revenue", "total_revenue = 42.0"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.track_type, Some(Track::Data));
        assert!(result.success);
        assert_eq!(result.score, 100.0);
        assert!(result.insights_found.is_some());
        assert!(runtime.leftover_containers(&run_id).await.unwrap().is_empty());
        assert_eq!(runtime.last_descriptor().unwrap().run_id, run_id);
    }

    #[tokio::test]
    async fn test_unknown_challenge_is_failed_result() {
        let service = service(Arc::new(FakeRuntime::new()));
        let result = service.execute(Uuid::new_v4(), &submission("nope", "x = 1")).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.track_type, None);
        assert_eq!(result.score, 0.0);
        assert!(result.errors[0].contains("Unknown challenge 'nope'"));
    }

    #[tokio::test]
    async fn test_oversized_code_rejected_without_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let service = service(runtime.clone());
        let code = "x".repeat(MAX_CODE_BYTES + 1);

        let result = service.execute(Uuid::new_v4(), &submission("revenue", &code)).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.track_type, Some(Track::Data));
        assert!(runtime.last_descriptor().is_none());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_status() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(timed_out())));
        let service = service(runtime);
        let mut request = submission("revenue", "while True: pass");
        request.test_config = Some(ChallengeSpec {
            timeout_seconds: Some(2),
            ..Default::default()
        });

        let result = service.execute(Uuid::new_v4(), &request).await;
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!result.success);
        assert_eq!(result.errors, vec!["execution timed out after 2s".to_string()]);
    }

    #[tokio::test]
    async fn test_request_cannot_extend_timeout() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(exited(0, &data_report()))));
        let service = service(runtime.clone());
        let mut request = submission("revenue", "total_revenue = 42.0");
        request.test_config = Some(ChallengeSpec {
            timeout_seconds: Some(u64::MAX),
            ..Default::default()
        });

        let handle = tokio::spawn({
            let service = service.clone();
            async move { service.execute(Uuid::new_v4(), &request).await }
        });
        let result = handle.await.expect("execute must not panic");

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(runtime.last_descriptor().unwrap().timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_challenge_timeout_capped_by_track() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(exited(0, &data_report()))));
        let service = service(runtime.clone());

        service.execute(Uuid::new_v4(), &submission("long-data", "x = 1")).await;
        assert_eq!(runtime.last_descriptor().unwrap().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_effective_timeout() {
        let manager = TrackConfigManager::built_in();
        let config = manager.get_config(Track::Cloud).unwrap();

        assert_eq!(effective_timeout(None, None, config), Duration::from_secs(120));
        assert_eq!(effective_timeout(Some(60), Some(10), config), Duration::from_secs(10));
        assert_eq!(effective_timeout(Some(60), Some(600), config), Duration::from_secs(60));
        assert_eq!(effective_timeout(None, Some(u64::MAX), config), Duration::from_secs(120));
        assert_eq!(effective_timeout(Some(u64::MAX), None, config), Duration::from_secs(900));
        assert_eq!(effective_timeout(Some(0), None, config), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_cloud_run_keeps_cleanup_warnings() {
        let runtime = Arc::new(FakeRuntime::new().with_exec(|command| {
            match command.get(1).map(String::as_str) {
                Some("apply") => timed_out(),
                _ => exited(0, ""),
            }
        }));
        let service = service(runtime.clone());
        let run_id = Uuid::new_v4();

        let result = service
            .execute(run_id, &submission("bucket-tf", "resource \"aws_s3_bucket\" \"b\" {}\n"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.errors[0], "execution timed out after 120s");
        assert!(
            result.errors[1..]
                .iter()
                .any(|e| e.starts_with("cleanup warning: terraform destroy skipped")),
            "{:?}",
            result.errors
        );
        assert!(runtime.leftover_containers(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlay_is_revalidated() {
        let runtime = Arc::new(FakeRuntime::new());
        let service = service(runtime.clone());
        let mut request = submission("revenue", "x = 1");
        request.test_config = Some(ChallengeSpec {
            validations: vec![
                ValidationRule::new("same", "variable_exists"),
                ValidationRule::new("same", "variable_exists"),
            ],
            ..Default::default()
        });

        let result = service.execute(Uuid::new_v4(), &request).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.errors[0].contains("test_config"));
        assert!(runtime.last_descriptor().is_none());
    }

    #[tokio::test]
    async fn test_track_type_matches_challenge_for_every_outcome() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_run(Ok(exited(0, "harness crashed before reporting")))
                .with_run(Err(ExecutionError::RuntimeUnavailable("daemon down".to_string()))),
        );
        let service = service(runtime);

        let web = service.execute(Uuid::new_v4(), &submission("hello-page", "<p>")).await;
        assert_eq!(web.track_type, Some(Track::Web));
        assert_eq!(web.status, ExecutionStatus::Failed);

        let data = service.execute(Uuid::new_v4(), &submission("revenue", "x = 1")).await;
        assert_eq!(data.track_type, Some(Track::Data));
        assert!(!data.success);

        let cloud = service.execute(Uuid::new_v4(), &submission("no-subtype", "")).await;
        assert_eq!(cloud.track_type, Some(Track::Cloud));
        assert!(cloud.errors[0].contains("no sub-type"));
    }

    #[tokio::test]
    async fn test_status_reports_every_track() {
        let service = service(Arc::new(FakeRuntime::new().unreachable()));
        let status = service.status().await;

        assert_eq!(status.keys().cloned().collect::<Vec<_>>(), vec!["cloud", "data", "web"]);
        assert!(status.values().all(|h| !h.runtime_reachable));
    }
}
