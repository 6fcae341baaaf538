// CLI commands for managing gradebox challenges and submissions
use anyhow::{bail, Context, Result};
use gradebox_common::config::Settings;
use gradebox_common::redis;
use gradebox_common::types::{
    Challenge, ChallengeSpec, ExecutionRequest, QueuedExecution, Track, MAX_CODE_BYTES, RULE_TYPES,
};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Sub-types the cloud runner dispatches on
const CLOUD_KINDS: &[&str] = &["terraform", "tf", "aws_cli", "aws-cli", "cli", "docker", "dockerfile"];

/// Longest timeout accepted without a warning
const LONG_TIMEOUT_SECONDS: u64 = 600;

/// A challenge document as written by content authors. The id may be
/// supplied on the command line instead.
#[derive(Debug, Deserialize)]
pub struct ChallengeDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub track: Track,
    pub validation_rules: ChallengeSpec,
}

impl ChallengeDocument {
    pub fn into_challenge(self, id: Option<&str>) -> Result<Challenge> {
        let id = id
            .map(str::to_string)
            .or(self.id)
            .context("Challenge has no id")?;
        Ok(Challenge {
            id,
            track: self.track,
            validation_rules: self.validation_rules,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    pub level: Level,
    pub message: String,
}

impl LintIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Level::Error => write!(f, "❌ {}", self.message),
            Level::Warning => write!(f, "⚠️  {}", self.message),
        }
    }
}

/// Problems the worker would hit with this challenge
pub fn lint(challenge: &Challenge) -> Vec<LintIssue> {
    let spec = &challenge.validation_rules;
    let mut issues = Vec::new();

    if let Err(e) = challenge.validate() {
        issues.push(LintIssue::error(e.to_string()));
    }
    if spec.validations.is_empty() {
        issues.push(LintIssue::warning("No validation rules; a clean run scores 100"));
    }

    // Web rule types belong to the harness
    if challenge.track != Track::Web {
        for rule in &spec.validations {
            if !RULE_TYPES.contains(&rule.rule_type.as_str()) {
                issues.push(LintIssue::error(format!(
                    "Rule '{}' has unknown type '{}'",
                    rule.name, rule.rule_type
                )));
            }
        }
    }

    match challenge.track {
        Track::Cloud => match spec.kind.as_deref().map(str::to_lowercase) {
            None => issues.push(LintIssue::error("Cloud challenge needs a \"type\" (terraform, aws_cli or docker)")),
            Some(kind) if !CLOUD_KINDS.contains(&kind.as_str()) => {
                issues.push(LintIssue::error(format!("Unsupported cloud challenge type '{}'", kind)))
            }
            Some(_) => {}
        },
        Track::Data => {
            if let Some(dataset) = &spec.dataset {
                if dataset.contains('/') || dataset.contains('\\') || dataset.contains("..") {
                    issues.push(LintIssue::error(format!(
                        "Dataset '{}' must be a bare file name",
                        dataset
                    )));
                }
            }
        }
        Track::Web => {}
    }

    match spec.timeout_seconds {
        Some(0) => issues.push(LintIssue::error("timeout_seconds must be positive")),
        Some(t) if t > LONG_TIMEOUT_SECONDS => issues.push(LintIssue::warning(format!(
            "timeout_seconds {} holds a worker slot for over {} minutes",
            t,
            LONG_TIMEOUT_SECONDS / 60
        ))),
        _ => {}
    }

    issues
}

fn read_document(file: &Path) -> Result<ChallengeDocument> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", file.display()))
}

/// Print issues; error when any is an error
fn report(issues: &[LintIssue]) -> Result<()> {
    for issue in issues {
        println!("  {}", issue);
    }
    let errors = issues.iter().filter(|i| i.level == Level::Error).count();
    if errors > 0 {
        bail!("Challenge has {} error(s)", errors);
    }
    Ok(())
}

async fn connect() -> Result<(::redis::aio::ConnectionManager, Settings)> {
    let settings = Settings::from_env();
    let client = ::redis::Client::open(settings.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;
    Ok((conn, settings))
}

pub fn lint_challenge(file: &Path) -> Result<()> {
    println!("🔍 Linting {}", file.display());
    let document = read_document(file)?;
    let challenge = document.into_challenge(Some("lint"))?;
    report(&lint(&challenge))?;
    println!("✅ Challenge is valid ({} rules)", challenge.validation_rules.validations.len());
    Ok(())
}

pub async fn add_challenge(id: &str, file: &Path) -> Result<()> {
    println!("🚀 Adding challenge: {}", id);
    let challenge = read_document(file)?.into_challenge(Some(id))?;
    report(&lint(&challenge))?;

    let (mut conn, _) = connect().await?;
    redis::put_challenge(&mut conn, &challenge)
        .await
        .context("Failed to store challenge")?;
    println!("✅ Stored challenge '{}' ({} track)", challenge.id, challenge.track);
    Ok(())
}

pub async fn submit(challenge: &str, user: &str, file: &Path, language: Option<String>) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if code.len() > MAX_CODE_BYTES {
        bail!("Submission is {} bytes; the limit is {} bytes", code.len(), MAX_CODE_BYTES);
    }

    let queued = QueuedExecution::new(ExecutionRequest {
        challenge_id: challenge.to_string(),
        user_id: user.to_string(),
        code,
        language,
        test_config: None,
    });

    let (mut conn, settings) = connect().await?;
    redis::push_execution(&mut conn, &settings.queue_name, &queued)
        .await
        .context("Failed to queue submission")?;
    println!("{}", queued.id);
    Ok(())
}

pub async fn show_result(id: &Uuid) -> Result<()> {
    let (mut conn, _) = connect().await?;
    match redis::get_result(&mut conn, id).await.context("Failed to read result")? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("pending"),
    }
    Ok(())
}
