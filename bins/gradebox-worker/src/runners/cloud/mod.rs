/// Cloud track runner
///
/// **Sub-modes (challenge `type`):**
/// - `terraform` - init/plan/apply against the emulator, read state, always destroy
/// - `aws_cli` - run an ordered list of `aws` invocations against the emulator
/// - `docker` - build the submitted Dockerfile, optionally run it, probe it
///
/// Terraform and CLI runs keep one container alive on a per-run internal
/// network shared only with the emulator; each phase is an exec under the
/// run's remaining deadline. Submissions name their own resources, so runs
/// against the emulator hold it exclusively from session start to cleanup.

mod cli;
mod docker;
mod terraform;

use super::{RunJob, TrackOutcome, TrackRunner};
use crate::config::{CloudConfig, TrackConfig};
use crate::engine::{
    ContainerRunDescriptor, ContainerRuntime, ContainerSession, EmulatorAttachment, NetworkPolicy,
};
use crate::error::{CleanupWarning, ExecutionError};
use crate::evaluator::{AwsResourceKind, Check, ProbeResult};
use crate::lifecycle::RunLifecycle;
use crate::runners::Deadline;
use async_trait::async_trait;
use gradebox_common::types::{CommandRecord, Track, ValidationRule};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Upper bound on a single probe or cleanup call
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudMode {
    Terraform,
    Cli,
    Docker,
}

impl CloudMode {
    pub fn from_kind(kind: Option<&str>) -> Result<Self, ExecutionError> {
        let kind = kind.ok_or_else(|| {
            ExecutionError::Configuration("Cloud challenge has no sub-type".to_string())
        })?;
        match kind.trim().to_lowercase().as_str() {
            "terraform" | "tf" => Ok(CloudMode::Terraform),
            "aws_cli" | "aws-cli" | "cli" => Ok(CloudMode::Cli),
            "docker" | "dockerfile" => Ok(CloudMode::Docker),
            other => Err(ExecutionError::Configuration(format!(
                "Unsupported cloud challenge type '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudMode::Terraform => "terraform",
            CloudMode::Cli => "aws_cli",
            CloudMode::Docker => "docker",
        }
    }
}

pub struct CloudRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: TrackConfig,
    cloud: CloudConfig,
    emulator: Mutex<()>,
}

impl CloudRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TrackConfig, cloud: CloudConfig) -> Self {
        Self {
            runtime,
            config,
            cloud,
            emulator: Mutex::new(()),
        }
    }

    /// Exclusive use of the shared emulator; waiting does not count against the run
    async fn claim_emulator(&self, job: &RunJob<'_>) -> MutexGuard<'_, ()> {
        if let Ok(guard) = self.emulator.try_lock() {
            return guard;
        }
        debug!(run_id = %job.run_id, "Waiting for the emulator");
        self.emulator.lock().await
    }

    fn environment(&self) -> Vec<String> {
        let endpoint = self.cloud.endpoint();
        vec![
            "AWS_ACCESS_KEY_ID=test".to_string(),
            "AWS_SECRET_ACCESS_KEY=test".to_string(),
            format!("AWS_DEFAULT_REGION={}", self.cloud.region),
            format!("AWS_REGION={}", self.cloud.region),
            format!("AWS_ENDPOINT_URL={}", endpoint),
            "AWS_PAGER=".to_string(),
            "HOME=/workspace".to_string(),
            "TF_IN_AUTOMATION=1".to_string(),
            "TF_INPUT=0".to_string(),
            "CHECKPOINT_DISABLE=1".to_string(),
        ]
    }

    /// Long-lived tooling container attached to the emulator
    fn session_descriptor(&self, job: &RunJob<'_>) -> ContainerRunDescriptor {
        // Outlives the run budget so destroy can still execute
        let keepalive = job
            .timeout
            .as_secs()
            .saturating_add(self.cloud.destroy_timeout_seconds.saturating_mul(2))
            .saturating_add(30);
        let mut descriptor =
            ContainerRunDescriptor::new(job.run_id, Track::Cloud, &self.config.image, &self.config)
                .with_command(vec!["sleep".to_string(), keepalive.to_string()])
                .with_env(self.environment())
                .with_network(NetworkPolicy::Isolated {
                    emulator: Some(EmulatorAttachment {
                        container: self.cloud.emulator_container.clone(),
                        alias: self.cloud.emulator_alias.clone(),
                    }),
                })
                .with_timeout(job.timeout);
        descriptor.working_dir = Some("/workspace".to_string());
        descriptor
    }

    fn endpoint_args(&self) -> [String; 2] {
        ["--endpoint-url".to_string(), self.cloud.endpoint()]
    }

    fn probe_command(&self, kind: AwsResourceKind, name: &str) -> Vec<String> {
        let (service, operation, flag) = match kind {
            AwsResourceKind::S3Bucket => ("s3api", "head-bucket", "--bucket"),
            AwsResourceKind::DynamodbTable => ("dynamodb", "describe-table", "--table-name"),
            AwsResourceKind::SqsQueue => ("sqs", "get-queue-url", "--queue-name"),
            AwsResourceKind::LambdaFunction => ("lambda", "get-function", "--function-name"),
            AwsResourceKind::IamRole => ("iam", "get-role", "--role-name"),
        };
        let mut command: Vec<String> = ["aws", service, operation, flag, name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        command.extend(self.endpoint_args());
        command
    }

    /// Removal command for a probed resource
    fn delete_command(&self, kind: AwsResourceKind, name: &str) -> Vec<String> {
        let endpoint = self.cloud.endpoint();
        let mut command: Vec<String> = match kind {
            AwsResourceKind::S3Bucket => vec![
                "aws".into(),
                "s3".into(),
                "rb".into(),
                format!("s3://{}", name),
                "--force".into(),
            ],
            AwsResourceKind::DynamodbTable => vec![
                "aws".into(),
                "dynamodb".into(),
                "delete-table".into(),
                "--table-name".into(),
                name.into(),
            ],
            AwsResourceKind::SqsQueue => vec![
                "aws".into(),
                "sqs".into(),
                "delete-queue".into(),
                "--queue-url".into(),
                format!("{}/000000000000/{}", endpoint, name),
            ],
            AwsResourceKind::LambdaFunction => vec![
                "aws".into(),
                "lambda".into(),
                "delete-function".into(),
                "--function-name".into(),
                name.into(),
            ],
            AwsResourceKind::IamRole => vec![
                "aws".into(),
                "iam".into(),
                "delete-role".into(),
                "--role-name".into(),
                name.into(),
            ],
        };
        command.extend(self.endpoint_args());
        command
    }

    /// Probe every `aws_resource_exists` rule, keyed by rule name
    async fn run_probes(
        &self,
        session: &mut dyn ContainerSession,
        rules: &[ValidationRule],
        deadline: &Deadline,
    ) -> Result<BTreeMap<String, ProbeResult>, ExecutionError> {
        let mut probes = BTreeMap::new();

        for (rule, kind, name) in aws_targets(rules) {
            let command = self.probe_command(kind, &name);
            let budget = deadline.remaining().min(PROBE_TIMEOUT);
            if budget.is_zero() {
                return Err(deadline.timeout_error());
            }

            let raw = session.exec(&command, &[], budget).await?;
            if raw.timed_out {
                return Err(deadline.timeout_error());
            }

            probes.insert(
                rule.name.clone(),
                ProbeResult {
                    exists: raw.succeeded(),
                    detail: super::tail(&raw.log, 3),
                },
            );
        }
        Ok(probes)
    }

    /// Best-effort removal of emulator resources found by the probes
    async fn remove_probed(
        &self,
        session: &mut dyn ContainerSession,
        rules: &[ValidationRule],
        probes: &BTreeMap<String, ProbeResult>,
    ) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();

        for (rule, kind, name) in aws_targets(rules) {
            if !probes.get(&rule.name).map_or(false, |p| p.exists) {
                continue;
            }
            let command = self.delete_command(kind, &name);
            match session.exec(&command, &[], PROBE_TIMEOUT).await {
                Ok(raw) if raw.succeeded() => {}
                Ok(raw) => {
                    warn!(resource = %name, exit_code = ?raw.exit_code, "Failed to remove emulator resource");
                    warnings.push(CleanupWarning::new(format!(
                        "emulator resource '{}' not removed: {}",
                        name,
                        super::tail(&raw.log, 3)
                    )));
                }
                Err(e) => {
                    warnings.push(CleanupWarning::new(format!(
                        "emulator resource '{}' not removed: {}",
                        name, e
                    )));
                    break;
                }
            }
        }
        warnings
    }
}

/// Rules that name an emulator resource
fn aws_targets(rules: &[ValidationRule]) -> Vec<(&ValidationRule, AwsResourceKind, String)> {
    rules
        .iter()
        .filter_map(|rule| match Check::parse(rule) {
            Ok(Check::AwsResourceExists { service, name }) => Some((rule, service, name)),
            _ => None,
        })
        .collect()
}

/// Display form of an exec'd command
fn render(command: &[String]) -> String {
    command.join(" ")
}

fn record(command: &[String], raw: &crate::engine::RawRunResult) -> CommandRecord {
    CommandRecord {
        command: render(command),
        exit_code: raw.exit_code,
        output: raw.log.clone(),
        timed_out: raw.timed_out,
    }
}

/// Transcript of the recorded commands
fn transcript(records: &[CommandRecord]) -> String {
    records
        .iter()
        .map(|r| format!("$ {}\n{}", r.command, r.output.trim_end()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl TrackRunner for CloudRunner {
    fn track(&self) -> Track {
        Track::Cloud
    }

    fn image(&self) -> &str {
        &self.config.image
    }

    #[instrument(skip(self, job, lifecycle), fields(run_id = %job.run_id, track = "cloud"))]
    async fn run(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        match CloudMode::from_kind(job.spec.kind.as_deref())? {
            CloudMode::Terraform => self.run_terraform(job, lifecycle).await,
            CloudMode::Cli => self.run_cli(job, lifecycle).await,
            CloudMode::Docker => self.run_docker(job, lifecycle).await,
        }
    }
}
