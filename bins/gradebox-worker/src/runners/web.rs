// Web track: submitted HTML/CSS/JS is handed to a headless test harness
// inside the web image. The harness owns the web rule vocabulary and reports
// one entry per test.

use super::{classify_failure, RunJob, TrackOutcome, TrackRunner};
use crate::config::TrackConfig;
use crate::engine::{ContainerRunDescriptor, ContainerRuntime};
use crate::error::ExecutionError;
use crate::evaluator::{self, ExecutionContext, WebContext};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::protocol::{self, ContainerPayload, WebReport};
use crate::scoring::{RulePassRate, ScoreInput, ScoringPolicy};
use async_trait::async_trait;
use gradebox_common::types::{Setup, Track, ValidationOutcome};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct WebRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: TrackConfig,
    scoring: RulePassRate,
}

impl WebRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TrackConfig) -> Self {
        let scoring = RulePassRate {
            pass_threshold: config.pass_threshold,
        };
        Self {
            runtime,
            config,
            scoring,
        }
    }

    fn payload(&self, job: &RunJob<'_>) -> ContainerPayload {
        let mut payload = ContainerPayload::new("web", job.request.code.as_str());
        payload.setup = job.spec.setup.as_ref().map(Setup::as_script);
        payload.validations = job.spec.validations.clone();
        payload
    }
}

#[async_trait]
impl TrackRunner for WebRunner {
    fn track(&self) -> Track {
        Track::Web
    }

    fn image(&self) -> &str {
        &self.config.image
    }

    #[instrument(skip(self, job, lifecycle), fields(run_id = %job.run_id, track = "web"))]
    async fn run(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        lifecycle.advance(RunState::Preparing);
        let arg = self.payload(job).to_arg()?;
        let descriptor = ContainerRunDescriptor::new(job.run_id, Track::Web, &self.config.image, &self.config)
            .with_command(vec![arg])
            .with_timeout(job.timeout);

        lifecycle.mark_allocated();
        lifecycle.advance(RunState::Running);
        let raw = self.runtime.run(&descriptor).await?;

        if raw.timed_out {
            lifecycle.advance(RunState::Timeout);
            return Err(ExecutionError::Timeout {
                seconds: job.timeout.as_secs(),
            });
        }

        lifecycle.advance(RunState::Collecting);
        let report: WebReport = protocol::parse_result(&raw.stdout)
            .map_err(|e| classify_failure(&raw, e))?;

        lifecycle.advance(RunState::Validating);
        let rules = &job.spec.validations;
        let validation_results = if rules.is_empty() {
            // No declared rules: the harness test list is the result
            report
                .tests
                .iter()
                .map(|t| ValidationOutcome {
                    name: t.name.clone(),
                    passed: t.passed,
                    message: t.message.clone(),
                })
                .collect()
        } else {
            let context = ExecutionContext::Web(WebContext {
                tests: report.tests.clone(),
            });
            evaluator::evaluate(rules, &context)
        };

        if let (Some(score), Some(max)) = (report.score, report.max_score) {
            info!(harness_score = score, harness_max = max, "Harness score");
        }

        lifecycle.advance(RunState::Scoring);
        let score = self.scoring.score(&ScoreInput {
            outcomes: &validation_results,
            run_clean: raw.exit_code == Some(0),
            ..Default::default()
        });

        if raw.exit_code != Some(0) {
            warn!(exit_code = ?raw.exit_code, "Harness exited non-zero after reporting");
        }

        lifecycle.begin_cleanup();
        Ok(TrackOutcome {
            validation_results,
            score,
            output: protocol::strip_result(&raw.log),
            errors: report.errors,
            cloud: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackConfigManager;
    use crate::fake_runtime::{exited, timed_out, FakeRuntime};
    use crate::protocol::frame_result;
    use crate::runners::test_support::{request, spec};
    use gradebox_common::types::ValidationRule;
    use std::time::Duration;
    use uuid::Uuid;

    fn runner(runtime: Arc<FakeRuntime>) -> WebRunner {
        let config = TrackConfigManager::built_in();
        WebRunner::new(runtime, config.get_config(Track::Web).unwrap().clone())
    }

    fn harness_output(heading_passed: bool) -> String {
        let report = serde_json::json!({
            "tests": [
                {"name": "has_heading", "passed": heading_passed,
                 "message": if heading_passed { "found" } else { "No <h1> containing 'Hello, World'" }},
                {"name": "has_title", "passed": true, "message": "title set"}
            ],
            "score": if heading_passed { 2 } else { 1 },
            "max_score": 2,
            "errors": []
        });
        format!("harness starting\n{}", frame_result(&report.to_string()))
    }

    #[tokio::test]
    async fn test_missing_heading_fails_rule() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(exited(0, &harness_output(false)))));
        let web = runner(runtime.clone());

        let request = request("<html><body><p>Hi</p></body></html>");
        let spec = spec(
            None,
            vec![
                ValidationRule::new("has_heading", "element_exists"),
                ValidationRule::new("has_title", "title_check"),
            ],
        );
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(30),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = web.run(&job, &mut lifecycle).await.unwrap();

        assert_eq!(outcome.validation_results.len(), 2);
        assert!(!outcome.validation_results[0].passed);
        assert!(outcome.score.score < outcome.score.max_score);
        assert!(!outcome.score.success);
        assert_eq!(outcome.output, "harness starting\n");

        let descriptor = runtime.last_descriptor().unwrap();
        assert_eq!(descriptor.image, "gradebox-web:latest");
        let payload: serde_json::Value = serde_json::from_str(&descriptor.command[0]).unwrap();
        assert_eq!(payload["type"], "web");
        assert_eq!(payload["validations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_harness_list_used_without_rules() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(exited(0, &harness_output(true)))));
        let web = runner(runtime);
        let request = request("<h1>Hello, World</h1>");
        let spec = spec(None, vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(30),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = web.run(&job, &mut lifecycle).await.unwrap();
        assert_eq!(outcome.validation_results.len(), 2);
        assert_eq!(outcome.score.score, 100.0);
        assert!(outcome.score.success);
    }

    #[tokio::test]
    async fn test_unparseable_output() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_run(Ok(exited(0, "no json here")))
                .with_run(Ok(exited(2, "Error: cannot find module 'jsdom'"))),
        );
        let web = runner(runtime);
        let request = request("<h1>x</h1>");
        let spec = spec(None, vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(30),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let err = web.run(&job, &mut lifecycle).await.unwrap_err();
        assert!(matches!(err, ExecutionError::OutputParse(_)));

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let err = web.run(&job, &mut lifecycle).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ContainerRuntime { exit_code: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runtime = Arc::new(FakeRuntime::new().with_run(Ok(timed_out())));
        let web = runner(runtime);
        let request = request("<script>while(true){}</script>");
        let spec = spec(None, vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(3),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let err = web.run(&job, &mut lifecycle).await.unwrap_err();
        assert_eq!(err, ExecutionError::Timeout { seconds: 3 });
        assert_eq!(lifecycle.state(), RunState::Timeout);
    }
}
