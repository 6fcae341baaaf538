// AWS CLI sub-mode: the submission is an ordered list of `aws` invocations.
// Each one is exec'd as argv (no shell) against the emulator and recorded.

use super::{record, render, transcript, CloudMode, CloudRunner};
use crate::engine::ContainerSession;
use crate::error::ExecutionError;
use crate::evaluator::{self, CliContext, ExecutionContext, ProbeResult};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::runners::{Deadline, RunJob, TrackOutcome};
use crate::scoring::{CommandBlend, ScoreInput, ScoringPolicy};
use gradebox_common::types::{CloudSummary, CommandRecord, Setup};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// One line of a submitted script after continuation joining
#[derive(Debug, Clone, PartialEq)]
pub(super) enum ScriptLine {
    Command(Vec<String>),
    Rejected { line: String, reason: String },
}

/// Split a command line into argv with POSIX-style quoting
pub(super) fn split_command_line(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Parse a submitted script. Blank lines and `#` comments are skipped,
/// trailing `\` joins lines, and only `aws` invocations are accepted.
pub(super) fn parse_cli_script(script: &str) -> Vec<ScriptLine> {
    let mut logical = Vec::new();
    let mut pending = String::new();

    for raw in script.lines() {
        let line = raw.trim_end();
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        logical.push(std::mem::take(&mut pending));
    }
    if !pending.trim().is_empty() {
        logical.push(pending);
    }

    logical.iter().filter_map(|line| parse_line(line)).collect()
}

/// One logical line; `None` for blanks and comments
fn parse_line(line: &str) -> Option<ScriptLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parsed = match split_command_line(line) {
        Ok(argv) if argv.first().map(String::as_str) == Some("aws") && argv.len() > 1 => {
            ScriptLine::Command(argv)
        }
        Ok(_) => ScriptLine::Rejected {
            line: line.to_string(),
            reason: "only `aws` commands are allowed".to_string(),
        },
        Err(reason) => ScriptLine::Rejected {
            line: line.to_string(),
            reason,
        },
    };
    Some(parsed)
}

/// Setup scripts get continuation joining; command lists are one command per entry
pub(super) fn parse_setup(setup: &Setup) -> Vec<ScriptLine> {
    match setup {
        Setup::Script(script) => parse_cli_script(script),
        Setup::Commands(commands) => commands.iter().filter_map(|c| parse_line(c)).collect(),
    }
}

struct Executed {
    records: Vec<CommandRecord>,
    probes: BTreeMap<String, ProbeResult>,
    outcome: TrackOutcome,
}

impl CloudRunner {
    /// Pin the emulator endpoint unless the command already names one
    fn with_endpoint(&self, mut argv: Vec<String>) -> Vec<String> {
        if !argv.iter().any(|a| a == "--endpoint-url" || a.starts_with("--endpoint-url=")) {
            argv.extend(self.endpoint_args());
        }
        argv
    }

    pub(super) async fn run_cli(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        lifecycle.advance(RunState::Preparing);
        let script = parse_cli_script(&job.request.code);
        let setup = job.spec.setup.as_ref().map(parse_setup).unwrap_or_default();

        let _emulator = self.claim_emulator(job).await;
        let deadline = Deadline::new(job.timeout);
        let mut session = self.runtime.open_session(&self.session_descriptor(job)).await?;
        lifecycle.mark_allocated();

        let executed = self
            .execute_script(session.as_mut(), job, &setup, &script, &deadline, lifecycle)
            .await;

        lifecycle.begin_cleanup();
        let mut warnings = match &executed {
            Ok(run) => {
                self.remove_probed(session.as_mut(), &job.spec.validations, &run.probes)
                    .await
            }
            Err(_) => Vec::new(),
        };
        warnings.extend(session.close().await);

        let mut run = match executed {
            Ok(run) => run,
            Err(e) => {
                lifecycle.record_warnings(warnings);
                return Err(e);
            }
        };
        run.outcome.errors.extend(warnings.iter().map(|w| w.to_string()));
        run.outcome.cloud = Some(CloudSummary {
            mode: CloudMode::Cli.as_str().to_string(),
            resources: Vec::new(),
            commands: run.records,
            destroyed: None,
        });
        Ok(run.outcome)
    }

    async fn execute_script(
        &self,
        session: &mut dyn ContainerSession,
        job: &RunJob<'_>,
        setup: &[ScriptLine],
        script: &[ScriptLine],
        deadline: &Deadline,
        lifecycle: &mut RunLifecycle,
    ) -> Result<Executed, ExecutionError> {
        lifecycle.advance(RunState::Running);

        for line in setup {
            match line {
                ScriptLine::Command(argv) => {
                    let command = self.with_endpoint(argv.clone());
                    let raw = session.exec(&command, &[], deadline.remaining()).await?;
                    if raw.timed_out {
                        lifecycle.advance(RunState::Timeout);
                        return Err(deadline.timeout_error());
                    }
                    if !raw.succeeded() {
                        warn!(command = %render(&command), exit_code = ?raw.exit_code, "Setup command failed");
                    }
                }
                ScriptLine::Rejected { line, reason } => {
                    warn!(line = %line, reason = %reason, "Skipping setup line");
                }
            }
        }

        let mut records = Vec::new();
        let mut errors = Vec::new();
        for line in script {
            match line {
                ScriptLine::Command(argv) => {
                    if deadline.expired() {
                        lifecycle.advance(RunState::Timeout);
                        return Err(deadline.timeout_error());
                    }
                    let command = self.with_endpoint(argv.clone());
                    let raw = session.exec(&command, &[], deadline.remaining()).await?;
                    records.push(record(&command, &raw));
                    if raw.timed_out {
                        lifecycle.advance(RunState::Timeout);
                        return Err(deadline.timeout_error());
                    }
                }
                ScriptLine::Rejected { line, reason } => {
                    errors.push(format!("Rejected command '{}': {}", line, reason));
                    records.push(CommandRecord {
                        command: line.clone(),
                        exit_code: None,
                        output: reason.clone(),
                        timed_out: false,
                    });
                }
            }
        }
        if records.is_empty() {
            errors.push("Submission contains no aws commands".to_string());
        }
        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        info!(commands = records.len(), succeeded, "CLI commands executed");

        lifecycle.advance(RunState::Collecting);
        let probes = self
            .run_probes(session, &job.spec.validations, deadline)
            .await?;
        let output = transcript(&records);

        lifecycle.advance(RunState::Validating);
        let context = ExecutionContext::CliCommands(CliContext {
            commands: records.clone(),
            probes: probes.clone(),
            output: output.clone(),
        });
        let validation_results = evaluator::evaluate(&job.spec.validations, &context);

        lifecycle.advance(RunState::Scoring);
        let scoring = CommandBlend {
            pass_threshold: self.config.pass_threshold,
        };
        let score = scoring.score(&ScoreInput {
            outcomes: &validation_results,
            run_clean: true,
            commands: &records,
            ..Default::default()
        });

        Ok(Executed {
            records,
            probes,
            outcome: TrackOutcome {
                validation_results,
                score,
                output,
                errors,
                cloud: None,
            },
        })
    }
}
