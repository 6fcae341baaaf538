// Terraform sub-mode: init/plan/apply the submission against the emulator,
// capture state, validate, then destroy on its own budget.

use super::{record, transcript, CloudMode, CloudRunner};
use crate::engine::ContainerSession;
use crate::error::{CleanupWarning, ExecutionError};
use crate::evaluator::{self, ExecutionContext, StateResource, TerraformContext};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::runners::{all_failed, Deadline, RunJob, TrackOutcome};
use crate::scoring::{RulePassRate, ScoreInput, ScoringPolicy};
use gradebox_common::types::{CloudSummary, CommandRecord};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

const MAIN_TF: &str = "/workspace/main.tf";
const PROVIDER_TF: &str = "/workspace/gradebox_provider.tf";
const FILE_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Submissions use the fixed provider block; declaring their own is rejected
pub(super) fn declares_aws_provider(code: &str) -> bool {
    code.lines().any(|line| {
        let Some(rest) = line.trim_start().strip_prefix("provider") else {
            return false;
        };
        let rest = rest.trim_start();
        rest.strip_prefix('"')
            .unwrap_or(rest)
            .starts_with("aws")
    })
}

fn sh(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Managed resources from `terraform show -json`, child modules included
pub(super) fn parse_state(show_json: &str) -> Result<Vec<StateResource>, ExecutionError> {
    let document: Value = serde_json::from_str(show_json.trim())
        .map_err(|e| ExecutionError::OutputParse(format!("terraform state: {}", e)))?;

    let mut resources = Vec::new();
    if let Some(root) = document.pointer("/values/root_module") {
        collect_module(root, &mut resources);
    }
    Ok(resources)
}

fn collect_module(module: &Value, out: &mut Vec<StateResource>) {
    if let Some(resources) = module.get("resources").and_then(Value::as_array) {
        for resource in resources {
            if resource.get("mode").and_then(Value::as_str) != Some("managed") {
                continue;
            }
            let field = |key: &str| {
                resource
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            out.push(StateResource {
                address: field("address"),
                resource_type: field("type"),
                name: field("name"),
                values: resource.get("values").cloned().unwrap_or(Value::Null),
            });
        }
    }
    if let Some(children) = module.get("child_modules").and_then(Value::as_array) {
        for child in children {
            collect_module(child, out);
        }
    }
}

/// Everything captured before cleanup
struct Applied {
    records: Vec<CommandRecord>,
    /// `init` succeeded, so destroy is meaningful
    initialised: bool,
    resources: Vec<StateResource>,
    outcome: TrackOutcome,
}

impl CloudRunner {
    fn provider_block(&self) -> String {
        let endpoint = self.cloud.endpoint();
        let services = ["s3", "dynamodb", "sqs", "sns", "lambda", "iam", "sts", "ec2", "cloudwatch", "logs"];
        let endpoints: String = services
            .iter()
            .map(|s| format!("    {:<10} = \"{}\"\n", s, endpoint))
            .collect();

        format!(
            r#"provider "aws" {{
  region                      = "{region}"
  access_key                  = "test"
  secret_key                  = "test"
  skip_credentials_validation = true
  skip_metadata_api_check     = true
  skip_requesting_account_id  = true
  s3_use_path_style           = true

  endpoints {{
{endpoints}  }}
}}
"#,
            region = self.cloud.region,
            endpoints = endpoints
        )
    }

    pub(super) async fn run_terraform(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        let rules = &job.spec.validations;
        let scoring = RulePassRate {
            pass_threshold: self.config.pass_threshold,
        };

        lifecycle.advance(RunState::Preparing);
        if declares_aws_provider(&job.request.code) {
            let message = "Submissions must not declare a provider \"aws\" block";
            let validation_results = all_failed(rules, message);
            let score = scoring.score(&ScoreInput {
                outcomes: &validation_results,
                ..Default::default()
            });
            return Ok(TrackOutcome {
                validation_results,
                score,
                output: String::new(),
                errors: vec![message.to_string()],
                cloud: Some(CloudSummary {
                    mode: CloudMode::Terraform.as_str().to_string(),
                    ..Default::default()
                }),
            });
        }

        let _emulator = self.claim_emulator(job).await;
        let deadline = Deadline::new(job.timeout);
        let mut session = self.runtime.open_session(&self.session_descriptor(job)).await?;
        lifecycle.mark_allocated();

        let applied = self
            .apply_and_validate(session.as_mut(), job, &deadline, &scoring, lifecycle)
            .await;

        lifecycle.begin_cleanup();
        let (destroyed, destroy_records, mut warnings) = match &applied {
            Ok(run) if run.initialised => {
                let addresses: Vec<String> = run.resources.iter().map(|r| r.address.clone()).collect();
                self.destroy(session.as_mut(), job, &addresses).await
            }
            Ok(_) => (None, Vec::new(), Vec::new()),
            Err(e) => {
                // The session was killed or lost mid-phase; state went with it
                error!(
                    run_id = %job.run_id,
                    orphaned = true,
                    error = %e,
                    "Terraform run aborted before destroy"
                );
                (
                    Some(false),
                    Vec::new(),
                    vec![CleanupWarning::new(format!(
                        "terraform destroy skipped after aborted run: {}",
                        e
                    ))],
                )
            }
        };
        warnings.extend(session.close().await);

        let mut run = match applied {
            Ok(run) => run,
            Err(e) => {
                lifecycle.record_warnings(warnings);
                return Err(e);
            }
        };
        run.records.extend(destroy_records);
        run.outcome.output = transcript(&run.records);
        run.outcome.errors.extend(warnings.iter().map(|w| w.to_string()));
        run.outcome.cloud = Some(CloudSummary {
            mode: CloudMode::Terraform.as_str().to_string(),
            resources: run.resources.iter().map(|r| r.address.clone()).collect(),
            commands: run.records,
            destroyed,
        });
        Ok(run.outcome)
    }

    async fn apply_and_validate(
        &self,
        session: &mut dyn ContainerSession,
        job: &RunJob<'_>,
        deadline: &Deadline,
        scoring: &RulePassRate,
        lifecycle: &mut RunLifecycle,
    ) -> Result<Applied, ExecutionError> {
        let rules = &job.spec.validations;
        session
            .write_file(MAIN_TF, &job.request.code, FILE_WRITE_TIMEOUT.min(deadline.remaining()))
            .await?;
        session
            .write_file(PROVIDER_TF, &self.provider_block(), FILE_WRITE_TIMEOUT.min(deadline.remaining()))
            .await?;

        let plugin_dir = format!("-plugin-dir={}", self.cloud.terraform_plugin_dir);
        let phases = [
            ("init", sh(&["terraform", "init", "-input=false", "-no-color", &plugin_dir])),
            ("plan", sh(&["terraform", "plan", "-input=false", "-no-color", "-out=tfplan"])),
            ("apply", sh(&["terraform", "apply", "-input=false", "-no-color", "-auto-approve", "tfplan"])),
        ];

        lifecycle.advance(RunState::Running);
        let mut records = Vec::new();
        let mut failed_phase = None;
        let mut initialised = false;

        for (phase, command) in &phases {
            if deadline.expired() {
                lifecycle.advance(RunState::Timeout);
                return Err(deadline.timeout_error());
            }
            let raw = session.exec(command, &[], deadline.remaining()).await?;
            records.push(record(command, &raw));

            if raw.timed_out {
                lifecycle.advance(RunState::Timeout);
                return Err(deadline.timeout_error());
            }
            if !raw.succeeded() {
                info!(phase, exit_code = ?raw.exit_code, "Terraform phase failed");
                failed_phase = Some(*phase);
                break;
            }
            if *phase == "init" {
                initialised = true;
            }
        }

        lifecycle.advance(RunState::Collecting);
        let mut resources = Vec::new();
        let mut probes = Default::default();
        let mut errors = Vec::new();

        if let Some(phase) = failed_phase {
            let detail = records
                .last()
                .map(|r| crate::runners::tail(&r.output, 15))
                .unwrap_or_default();
            errors.push(format!("terraform {} failed:\n{}", phase, detail));
        } else {
            let show = sh(&["terraform", "show", "-json", "-no-color"]);
            let raw = session.exec(&show, &[], deadline.remaining()).await?;
            if raw.timed_out {
                lifecycle.advance(RunState::Timeout);
                return Err(deadline.timeout_error());
            }
            resources = parse_state(&raw.stdout)?;
            probes = self.run_probes(session, rules, deadline).await?;
        }

        lifecycle.advance(RunState::Validating);
        let validation_results = match failed_phase {
            Some(phase) => all_failed(rules, &format!("Not evaluated: terraform {} failed", phase)),
            None => {
                let context = ExecutionContext::Terraform(TerraformContext {
                    resources: resources.clone(),
                    probes,
                    output: transcript(&records),
                });
                evaluator::evaluate(rules, &context)
            }
        };

        lifecycle.advance(RunState::Scoring);
        let score = scoring.score(&ScoreInput {
            outcomes: &validation_results,
            run_clean: failed_phase.is_none(),
            ..Default::default()
        });

        Ok(Applied {
            records,
            initialised,
            resources,
            outcome: TrackOutcome {
                validation_results,
                score,
                output: String::new(),
                errors,
                cloud: None,
            },
        })
    }

    /// Destroy with retries on its own budget. A final failure is a warning
    /// naming what may be left in the emulator.
    async fn destroy(
        &self,
        session: &mut dyn ContainerSession,
        job: &RunJob<'_>,
        addresses: &[String],
    ) -> (Option<bool>, Vec<CommandRecord>, Vec<CleanupWarning>) {
        let command = sh(&["terraform", "destroy", "-input=false", "-no-color", "-auto-approve"]);
        let budget = Duration::from_secs(self.cloud.destroy_timeout_seconds);
        let attempts = 1 + self.cloud.destroy_retries;
        let mut records = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match session.exec(&command, &[], budget).await {
                Ok(raw) => {
                    records.push(record(&command, &raw));
                    if raw.succeeded() {
                        return (Some(true), records, Vec::new());
                    }
                    last_error = crate::runners::tail(&raw.log, 5);
                    warn!(run_id = %job.run_id, attempt, exit_code = ?raw.exit_code, "terraform destroy failed");
                    if raw.timed_out {
                        break;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        error!(
            run_id = %job.run_id,
            orphaned = true,
            resources = ?addresses,
            "terraform destroy failed, emulator resources may remain"
        );
        let warning = CleanupWarning::new(format!(
            "terraform destroy failed after {} attempt(s); possibly orphaned: [{}]; {}",
            records.len().max(1),
            addresses.join(", "),
            last_error
        ));
        (Some(false), records, vec![warning])
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::runner;
    use super::*;
    use crate::engine::ContainerRuntime;
    use crate::fake_runtime::{exited, timed_out, FakeRuntime};
    use crate::runners::test_support::{request, rule, spec};
    use crate::runners::TrackRunner;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    const BUCKET_TF: &str = r#"resource "aws_s3_bucket" "assets" {
  bucket = "gradebox-assets"
}
"#;

    fn state_json() -> String {
        json!({
            "format_version": "1.0",
            "values": {
                "root_module": {
                    "resources": [
                        {"address": "aws_s3_bucket.assets", "mode": "managed", "type": "aws_s3_bucket",
                         "name": "assets", "values": {"bucket": "gradebox-assets"}},
                        {"address": "data.aws_region.current", "mode": "data", "type": "aws_region",
                         "name": "current", "values": {}}
                    ],
                    "child_modules": [
                        {"resources": [
                            {"address": "module.queue.aws_sqs_queue.this", "mode": "managed",
                             "type": "aws_sqs_queue", "name": "this", "values": {"name": "jobs"}}
                        ]}
                    ]
                }
            }
        })
        .to_string()
    }

    fn verb(command: &[String]) -> &str {
        command.get(1).map(String::as_str).unwrap_or_default()
    }

    #[test]
    fn test_provider_detection() {
        assert!(declares_aws_provider("provider \"aws\" {\n region = \"x\"\n}"));
        assert!(declares_aws_provider("  provider aws {}"));
        assert!(!declares_aws_provider(BUCKET_TF));
        assert!(!declares_aws_provider("# providers are configured for you"));
    }

    #[test]
    fn test_parse_state_walks_modules() {
        let resources = parse_state(&state_json()).unwrap();
        let addresses: Vec<&str> = resources.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["aws_s3_bucket.assets", "module.queue.aws_sqs_queue.this"]);

        assert!(parse_state(r#"{"format_version": "1.0"}"#).unwrap().is_empty());
        assert!(matches!(parse_state("not json"), Err(ExecutionError::OutputParse(_))));
    }

    #[test]
    fn test_provider_block_points_at_emulator() {
        let cloud = runner(Arc::new(FakeRuntime::new()));
        let block = cloud.provider_block();
        assert!(block.starts_with("provider \"aws\" {"));
        assert!(block.contains("s3         = \"http://emulator:4566\""));
        assert!(block.contains("region                      = \"us-east-1\""));
    }

    #[tokio::test]
    async fn test_apply_validate_and_destroy() {
        let state = state_json();
        let runtime = Arc::new(FakeRuntime::new().with_exec(move |command| match verb(command) {
            "show" => exited(0, &state),
            "s3api" => exited(0, ""),
            _ => exited(0, "ok"),
        }));
        let cloud = runner(runtime.clone());

        let request = request(BUCKET_TF);
        let spec = spec(
            Some("terraform"),
            vec![
                rule("bucket_in_state", "resource_exists", json!({"resource_type": "aws_s3_bucket", "name": "gradebox-assets"})),
                rule("bucket_live", "aws_resource_exists", json!({"service": "s3", "name": "gradebox-assets"})),
            ],
        );
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(120),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        assert!(outcome.validation_results.iter().all(|o| o.passed), "{:?}", outcome.validation_results);
        assert_eq!(outcome.score.score, 100.0);
        let summary = outcome.cloud.unwrap();
        assert_eq!(summary.destroyed, Some(true));
        assert_eq!(summary.resources.len(), 2);

        let session = &runtime.sessions()[0];
        assert!(session.closed);
        assert_eq!(session.files[MAIN_TF], BUCKET_TF);
        assert!(session.files[PROVIDER_TF].contains("endpoints"));
        let verbs: Vec<&str> = session.execs.iter().map(|c| verb(c)).collect();
        assert_eq!(verbs, vec!["init", "plan", "apply", "show", "s3api", "destroy"]);
        assert!(session.execs[0].iter().any(|a| a == "-plugin-dir=/opt/terraform/plugins"));
    }

    #[tokio::test]
    async fn test_syntax_error_scores_zero_and_cleans_up() {
        let runtime = Arc::new(FakeRuntime::new().with_exec(|command| match verb(command) {
            "plan" => exited(1, "Error: Unsupported block type\n  on main.tf line 1"),
            _ => exited(0, ""),
        }));
        let cloud = runner(runtime.clone());

        let request = request("resource \"aws_s3_bucket\" \"b\" {\n  bucket = \n");
        let spec = spec(
            Some("terraform"),
            vec![rule("bucket", "resource_exists", json!({"resource_type": "aws_s3_bucket"}))],
        );
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(120),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        assert_eq!(outcome.score.score, 0.0);
        assert!(!outcome.score.success);
        assert!(outcome.errors[0].starts_with("terraform plan failed"));
        assert_eq!(outcome.validation_results.len(), 1);
        assert!(!outcome.validation_results[0].passed);

        let session = &runtime.sessions()[0];
        assert!(session.closed);
        assert_eq!(session.execs.last().map(|c| verb(c)), Some("destroy"));
        assert_eq!(outcome.cloud.unwrap().destroyed, Some(true));
    }

    #[tokio::test]
    async fn test_destroy_is_retried_then_warns() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let counter = destroys.clone();
        let runtime = Arc::new(FakeRuntime::new().with_exec(move |command| match verb(command) {
            "show" => exited(0, r#"{"values": {"root_module": {"resources": []}}}"#),
            "destroy" => {
                counter.fetch_add(1, Ordering::SeqCst);
                exited(1, "Error: emulator unavailable")
            }
            _ => exited(0, ""),
        }));
        let cloud = runner(runtime.clone());

        let request = request(BUCKET_TF);
        let spec = spec(Some("terraform"), vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(120),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();

        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        // Warning only: grading stands
        assert!(outcome.score.success);
        assert!(outcome.errors.iter().any(|e| e.contains("cleanup warning: terraform destroy failed")));
        assert_eq!(outcome.cloud.unwrap().destroyed, Some(false));
    }

    #[tokio::test]
    async fn test_apply_timeout_closes_session() {
        let runtime = Arc::new(FakeRuntime::new().with_exec(|command| match verb(command) {
            "apply" => timed_out(),
            _ => exited(0, ""),
        }));
        let cloud = runner(runtime.clone());

        let request = request(BUCKET_TF);
        let spec = spec(Some("terraform"), vec![]);
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(60),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let err = cloud.run(&job, &mut lifecycle).await.unwrap_err();
        assert_eq!(err, ExecutionError::Timeout { seconds: 60 });
        assert!(runtime.sessions()[0].closed);
        assert_eq!(lifecycle.warnings().len(), 1);
        assert!(lifecycle.warnings()[0].0.starts_with("terraform destroy skipped"));
        assert!(runtime.leftover_containers(&job.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_own_provider_rejected_without_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let cloud = runner(runtime.clone());
        let request = request("provider \"aws\" {\n  region = \"eu-west-1\"\n}\n");
        let spec = spec(
            Some("terraform"),
            vec![rule("any", "resource_exists", json!({"resource_type": "aws_s3_bucket"}))],
        );
        let job = RunJob {
            run_id: Uuid::new_v4(),
            request: &request,
            spec: &spec,
            timeout: Duration::from_secs(60),
        };

        let mut lifecycle = RunLifecycle::new(job.run_id);
        let outcome = cloud.run(&job, &mut lifecycle).await.unwrap();
        assert_eq!(outcome.score.score, 0.0);
        assert!(runtime.sessions().is_empty());
    }
}
