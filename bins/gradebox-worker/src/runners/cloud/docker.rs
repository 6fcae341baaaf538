// Docker sub-mode: build the submitted Dockerfile without network access,
// optionally start it on an isolated network and probe it, then remove
// both container and image whatever happened.

use super::{CloudMode, CloudRunner};
use crate::engine::{ContainerRunDescriptor, ImageBuild, NetworkPolicy};
use crate::error::ExecutionError;
use crate::evaluator::{self, Check, DockerContext, ExecutionContext};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::runners::{tail, Deadline, RunJob, TrackOutcome};
use crate::scoring::{RulePassRate, ScoreInput, ScoringPolicy};
use gradebox_common::types::{CloudSummary, ContainerRunSpec, Track, ValidationRule};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

pub(super) fn submission_tag(run_id: &uuid::Uuid) -> String {
    format!("gradebox-submission-{}", run_id)
}

/// Ports to probe: those the challenge publishes plus any a rule names
fn ports_to_probe(rules: &[ValidationRule], run: Option<&ContainerRunSpec>) -> BTreeSet<u16> {
    let mut ports: BTreeSet<u16> = run.map(|r| r.ports.iter().copied().collect()).unwrap_or_default();
    for rule in rules {
        if let Ok(Check::PortAccessible { port }) = Check::parse(rule) {
            ports.insert(port);
        }
    }
    ports
}

/// Whether the built image has to be started at all
fn needs_container(rules: &[ValidationRule], run: Option<&ContainerRunSpec>) -> bool {
    run.is_some()
        || rules.iter().any(|rule| {
            matches!(
                Check::parse(rule),
                Ok(Check::ContainerRunning | Check::PortAccessible { .. })
            )
        })
}

impl CloudRunner {
    pub(super) async fn run_docker(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        lifecycle.advance(RunState::Preparing);
        let deadline = Deadline::new(job.timeout);
        let tag = submission_tag(&job.run_id);
        let build = ImageBuild {
            run_id: job.run_id,
            tag: tag.clone(),
            dockerfile: job.request.code.clone(),
            memory_limit_bytes: u64::from(self.cloud.build_memory_limit_mb) * 1024 * 1024,
            timeout: deadline.remaining(),
        };

        lifecycle.mark_allocated();
        lifecycle.advance(RunState::Running);
        let result = self.build_and_probe(job, &build, &deadline, lifecycle).await;

        lifecycle.begin_cleanup();
        let warning = self.runtime.remove_image(&tag).await.err();
        if let Some(w) = &warning {
            warn!(image = %tag, "{}", w);
        }

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                lifecycle.record_warnings(warning);
                return Err(e);
            }
        };
        outcome.errors.extend(warning.map(|w| w.to_string()));
        Ok(outcome)
    }

    async fn build_and_probe(
        &self,
        job: &RunJob<'_>,
        build: &ImageBuild,
        deadline: &Deadline,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        let rules = &job.spec.validations;
        let run_spec = job.spec.run.as_ref();

        let built = match self.runtime.build_image(build).await {
            Err(ExecutionError::Timeout { .. }) => {
                lifecycle.advance(RunState::Timeout);
                return Err(deadline.timeout_error());
            }
            other => other?,
        };
        info!(image = %build.tag, success = built.success, "Image build finished");

        let mut errors = Vec::new();
        if let Some(error) = &built.error {
            errors.push(format!("docker build failed: {}\n{}", error, tail(&built.log, 15)));
        }

        lifecycle.advance(RunState::Collecting);
        let mut context = DockerContext {
            image_built: built.success,
            image_tag: build.tag.clone(),
            ..Default::default()
        };
        if built.success && needs_container(rules, run_spec) {
            let mut descriptor =
                ContainerRunDescriptor::new(job.run_id, Track::Cloud, &build.tag, &self.config)
                    .with_network(NetworkPolicy::Isolated { emulator: None })
                    .with_timeout(deadline.remaining());
            if let Some(run) = run_spec {
                descriptor = descriptor
                    .with_env(run.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect());
                if let Some(command) = &run.command {
                    descriptor = descriptor.with_command(command.clone());
                }
            }

            let session = self.runtime.open_session(&descriptor).await?;
            tokio::time::sleep(
                Duration::from_millis(self.cloud.docker_startup_grace_ms).min(deadline.remaining()),
            )
            .await;

            let running = session.is_running().await.unwrap_or(false);
            context.container_running = Some(running);
            let probe_timeout = Duration::from_millis(self.cloud.port_probe_timeout_ms);
            for port in ports_to_probe(rules, run_spec) {
                let open = running && session.probe_port(port, probe_timeout).await;
                context.open_ports.insert(port, open);
            }
            for warning in session.close().await {
                errors.push(warning.to_string());
            }
        }

        lifecycle.advance(RunState::Validating);
        let validation_results = evaluator::evaluate(rules, &ExecutionContext::Docker(context));

        lifecycle.advance(RunState::Scoring);
        let scoring = RulePassRate {
            pass_threshold: self.config.pass_threshold,
        };
        let score = scoring.score(&ScoreInput {
            outcomes: &validation_results,
            run_clean: built.success,
            ..Default::default()
        });

        Ok(TrackOutcome {
            validation_results,
            score,
            output: built.log,
            errors,
            cloud: Some(CloudSummary {
                mode: CloudMode::Docker.as_str().to_string(),
                resources: vec![build.tag.clone()],
                commands: Vec::new(),
                destroyed: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::runner;
    use super::*;
    use crate::engine::{ContainerRuntime, ImageBuildOutput};
    use crate::fake_runtime::FakeRuntime;
    use crate::runners::test_support::{request, rule, spec};
    use crate::runners::TrackRunner;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    const DOCKERFILE: &str = "FROM nginx:alpine\nEXPOSE 80\n";

    fn job_rules() -> Vec<ValidationRule> {
        vec![
            rule("built", "image_exists", json!({})),
            rule("running", "container_running", json!({})),
            rule("http", "port_accessible", json!({"port": 80})),
        ]
    }

    #[test]
    fn test_container_only_when_needed() {
        let image_only = vec![rule("built", "image_exists", json!({}))];
        assert!(!needs_container(&image_only, None));
        assert!(needs_container(&job_rules(), None));
        assert!(needs_container(&image_only, Some(&ContainerRunSpec::default())));

        let run = ContainerRunSpec {
            ports: vec![8080],
            ..Default::default()
        };
        let ports: Vec<u16> = ports_to_probe(&job_rules(), Some(&run)).into_iter().collect();
        assert_eq!(ports, vec![80, 8080]);
    }

    #[tokio::test]
    async fn test_build_run_probe_and_remove() {
        let runtime = Arc::new(FakeRuntime::new().with_container(true, &[80]));
        let cloud = runner(runtime.clone());
        let request = request(DOCKERFILE);
        let spec = spec(Some("docker"), job_rules());
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(60),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        assert!(outcome.validation_results.iter().all(|o| o.passed), "{:?}", outcome.validation_results);
        assert_eq!(outcome.score.score, 100.0);

        let tag = submission_tag(&job.run_id);
        let state = runtime.state.lock().unwrap();
        assert_eq!(state.builds[0].tag, tag);
        assert_eq!(state.builds[0].dockerfile, DOCKERFILE);
        assert_eq!(state.removed_images, vec![tag.clone()]);
        assert!(state.sessions[0].closed);
        assert_eq!(state.sessions[0].image, tag);
        assert!(matches!(
            state.descriptors[0].network,
            NetworkPolicy::Isolated { emulator: None }
        ));
    }

    #[tokio::test]
    async fn test_failed_build_skips_container_and_still_removes_image() {
        let runtime = Arc::new(FakeRuntime::new().with_build(Ok(ImageBuildOutput {
            success: false,
            log: "Step 1/2 : FROM nope\n".to_string(),
            error: Some("pull access denied for nope".to_string()),
        })));
        let cloud = runner(runtime.clone());
        let request = request("FROM nope\n");
        let spec = spec(Some("docker"), job_rules());
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(60),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        assert_eq!(outcome.score.score, 0.0);
        assert!(outcome.errors[0].contains("pull access denied"));
        assert!(runtime.sessions().is_empty());
        assert_eq!(runtime.state.lock().unwrap().removed_images.len(), 1);
    }

    #[tokio::test]
    async fn test_exited_container_fails_port_checks() {
        let runtime = Arc::new(FakeRuntime::new().with_container(false, &[80]));
        let cloud = runner(runtime.clone());
        let request = request(DOCKERFILE);
        let spec = spec(Some("docker"), job_rules());
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(60),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        let passed: Vec<bool> = outcome.validation_results.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![true, false, false]);
        assert!(runtime.leftover_containers(&job.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let runtime = Arc::new(
            FakeRuntime::new().with_build(Err(ExecutionError::Timeout { seconds: 5 })),
        );
        let cloud = runner(runtime.clone());
        let request = request("FROM alpine\nRUN sleep 999\n");
        let spec = spec(Some("docker"), vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(5),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let err = cloud.run(&job, &mut lifecycle).await.unwrap_err();
        assert_eq!(err, ExecutionError::Timeout { seconds: 5 });
        assert_eq!(runtime.state.lock().unwrap().removed_images.len(), 1);
    }
}
