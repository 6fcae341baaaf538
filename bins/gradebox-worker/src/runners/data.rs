// Data track: the submission runs inside a generated Python driver that
// loads the dataset into `df`, runs setup and submission in one namespace,
// then reports a snapshot of the variables the submission created.
// Setup and submission reach the driver verbatim through chunked environment
// entries, so the payload argument stays small whatever the code contains.

use super::{classify_failure, RunJob, TrackOutcome, TrackRunner};
use crate::config::{DataConfig, TrackConfig};
use crate::engine::{ContainerRunDescriptor, ContainerRuntime};
use crate::error::ExecutionError;
use crate::evaluator::{self, DataContext, ExecutionContext};
use crate::lifecycle::{RunLifecycle, RunState};
use crate::protocol::{self, ContainerPayload, DataReport};
use crate::scoring::{InsightBonus, ScoreInput, ScoringPolicy};
use async_trait::async_trait;
use gradebox_common::types::{ChallengeSpec, Track};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

const DATASET_EXTENSIONS: &[&str] = &["csv", "tsv", "json", "parquet", "xlsx"];

/// Largest single environment value; the kernel caps one string at 128 KiB
const ENV_CHUNK_BYTES: usize = 64 * 1024;
const CODE_ENV: &str = "GRADEBOX_CODE";
const SETUP_ENV: &str = "GRADEBOX_SETUP";

const DRIVER_PRELUDE: &str = r#"import json
import os
import sys
import traceback
import types

import numpy as np
import pandas as pd

"#;

const DRIVER_BODY: &str = r#"
_GB_BEGIN = "@@GRADEBOX_RESULT_BEGIN@@"
_GB_END = "@@GRADEBOX_RESULT_END@@"
_GB_CHECKS = json.loads(_GB_CHECKS_JSON)


def _gb_env_text(prefix):
    parts = []
    while True:
        part = os.environ.pop("%s_%d" % (prefix, len(parts)), None)
        if part is None:
            return "".join(parts)
        parts.append(part)


_GB_SETUP = _gb_env_text("GRADEBOX_SETUP")
_GB_CODE = _gb_env_text("GRADEBOX_CODE")

_gb_ns = {"__name__": "__main__", "__builtins__": __builtins__, "np": np, "pd": pd}
_gb_error = None


def _gb_load(path):
    if path.endswith(".csv"):
        return pd.read_csv(path)
    if path.endswith(".tsv"):
        return pd.read_csv(path, sep="\t")
    if path.endswith(".json"):
        return pd.read_json(path)
    if path.endswith(".parquet"):
        return pd.read_parquet(path)
    return pd.read_excel(path)


try:
    if _GB_DATASET is not None:
        _gb_ns["df"] = _gb_load(_GB_DATASET)
    if _GB_SETUP:
        exec(compile(_GB_SETUP, "<setup>", "exec"), _gb_ns)
except Exception:
    _gb_error = "setup failed:\n" + traceback.format_exc()

_gb_baseline = set(_gb_ns)

if _gb_error is None:
    try:
        exec(compile(_GB_CODE, "<submission>", "exec"), _gb_ns)
    except BaseException:
        _gb_error = traceback.format_exc()


def _gb_json(value):
    try:
        return json.loads(json.dumps(value, allow_nan=False, default=str))
    except (TypeError, ValueError):
        return repr(value)


def _gb_snapshot(value):
    snap = {"type": type(value).__name__}
    try:
        if isinstance(value, pd.DataFrame):
            snap["shape"] = [int(n) for n in value.shape]
            snap["columns"] = [str(c) for c in value.columns]
            snap["length"] = len(value)
        elif isinstance(value, pd.Series):
            snap["shape"] = [len(value)]
            snap["length"] = len(value)
            if len(value) <= 1000:
                snap["value"] = _gb_json(value.tolist())
        elif isinstance(value, np.ndarray):
            snap["shape"] = [int(n) for n in value.shape]
            snap["length"] = int(value.shape[0]) if value.ndim else 1
            if value.size <= 1000:
                snap["value"] = _gb_json(value.tolist())
        elif isinstance(value, np.generic):
            snap["value"] = _gb_json(value.item())
        elif value is None or isinstance(value, (bool, int, float, str)):
            snap["value"] = _gb_json(value)
        elif isinstance(value, (list, tuple, set, frozenset, dict)):
            snap["length"] = len(value)
            if len(value) <= 1000:
                items = list(value) if isinstance(value, (set, frozenset)) else value
                snap["value"] = _gb_json(items)
    except Exception:
        pass
    return snap


def _gb_created():
    names = []
    for name, value in _gb_ns.items():
        if name.startswith("_"):
            continue
        if name in _gb_baseline and name != "df":
            continue
        if isinstance(value, (types.ModuleType, types.FunctionType, types.BuiltinFunctionType, type)):
            continue
        names.append(name)
    return names


_gb_checks = {}
for _gb_name, _gb_expr in _GB_CHECKS.items():
    try:
        _gb_ok = bool(eval(_gb_expr, _gb_ns))
        _gb_checks[_gb_name] = {
            "passed": _gb_ok,
            "message": ("Check passed: " if _gb_ok else "Check failed: ") + _gb_expr,
        }
    except Exception as _gb_exc:
        _gb_checks[_gb_name] = {
            "passed": False,
            "message": "Check raised %s: %s" % (type(_gb_exc).__name__, _gb_exc),
        }

_gb_report = {
    "variables": {name: _gb_snapshot(_gb_ns[name]) for name in _gb_created()},
    "checks": _gb_checks,
    "error": _gb_error,
}

sys.stdout.flush()
print(_GB_BEGIN)
print(json.dumps(_gb_report, default=str))
print(_GB_END)
sys.stdout.flush()
"#;

/// Python string literal for arbitrary text. A JSON string is a valid
/// Python literal.
fn py_str(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// `{prefix}_{n}=...` entries holding `text` in order, split on char boundaries
fn text_env(prefix: &str, text: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut cut = rest.len().min(ENV_CHUNK_BYTES);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        entries.push(format!("{}_{}={}", prefix, entries.len(), chunk));
        rest = tail;
    }
    entries
}

pub struct DataRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: TrackConfig,
    data: DataConfig,
    scoring: InsightBonus,
}

impl DataRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TrackConfig, data: DataConfig) -> Self {
        let scoring = InsightBonus {
            pass_threshold: config.pass_threshold,
            config: data.insight.clone(),
        };
        Self {
            runtime,
            config,
            data,
            scoring,
        }
    }

    /// Path of a named dataset inside the image. Names are plain file names.
    pub fn dataset_path(&self, name: &str) -> Result<String, ExecutionError> {
        let name = name.trim();
        let invalid = name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.contains("..");
        if invalid {
            return Err(ExecutionError::Configuration(format!(
                "Invalid dataset name '{}'",
                name
            )));
        }

        let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
        match extension {
            Some(ext) if DATASET_EXTENSIONS.contains(&ext.as_str()) => Ok(format!(
                "{}/{}",
                self.data.datasets_dir.trim_end_matches('/'),
                name
            )),
            _ => Err(ExecutionError::Configuration(format!(
                "Unsupported dataset format '{}'",
                name
            ))),
        }
    }

    /// `custom_check` expressions keyed by rule name
    fn custom_checks(spec: &ChallengeSpec) -> BTreeMap<String, String> {
        spec.validations
            .iter()
            .filter(|r| r.rule_type == "custom_check")
            .filter_map(|r| {
                r.params
                    .get("check")
                    .and_then(|c| c.as_str())
                    .map(|c| (r.name.clone(), c.to_string()))
            })
            .collect()
    }

    /// Generate the driver script that runs inside the data image
    pub fn build_script(&self, spec: &ChallengeSpec) -> Result<String, ExecutionError> {
        let dataset = match &spec.dataset {
            Some(name) => py_str(&self.dataset_path(name)?),
            None => "None".to_string(),
        };
        let checks = serde_json::to_string(&Self::custom_checks(spec))
            .map_err(|e| ExecutionError::Configuration(format!("custom checks: {}", e)))?;

        let mut script = String::from(DRIVER_PRELUDE);
        script.push_str(&format!("_GB_DATASET = {}\n", dataset));
        script.push_str(&format!("_GB_CHECKS_JSON = {}\n", py_str(&checks)));
        script.push_str(DRIVER_BODY);
        Ok(script)
    }

    /// Container environment: interpreter settings plus setup and submission text
    pub fn driver_env(spec: &ChallengeSpec, code: &str) -> Result<Vec<String>, ExecutionError> {
        let setup = spec.setup.as_ref().map(|s| s.as_script()).unwrap_or_default();
        if code.contains('\0') || setup.contains('\0') {
            return Err(ExecutionError::Configuration(
                "Code must not contain NUL bytes".to_string(),
            ));
        }

        let mut env = vec![
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
            "MPLBACKEND=Agg".to_string(),
            "HOME=/tmp".to_string(),
        ];
        env.extend(text_env(SETUP_ENV, &setup));
        env.extend(text_env(CODE_ENV, code));
        Ok(env)
    }
}

#[async_trait]
impl TrackRunner for DataRunner {
    fn track(&self) -> Track {
        Track::Data
    }

    fn image(&self) -> &str {
        &self.config.image
    }

    #[instrument(skip(self, job, lifecycle), fields(run_id = %job.run_id, track = "data"))]
    async fn run(
        &self,
        job: &RunJob<'_>,
        lifecycle: &mut RunLifecycle,
    ) -> Result<TrackOutcome, ExecutionError> {
        lifecycle.advance(RunState::Preparing);
        let script = self.build_script(job.spec)?;
        let env = Self::driver_env(job.spec, &job.request.code)?;

        let mut payload = ContainerPayload::new("data", script);
        payload.dataset = job.spec.dataset.clone();
        payload.validations = job.spec.validations.clone();

        let mut descriptor =
            ContainerRunDescriptor::new(job.run_id, Track::Data, &self.config.image, &self.config)
                .with_command(vec![payload.to_arg()?])
                .with_env(env)
                .with_timeout(job.timeout);
        descriptor.working_dir = Some("/workspace".to_string());

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
        let report: DataReport =
            protocol::parse_result(&raw.stdout).map_err(|e| classify_failure(&raw, e))?;
        let output = protocol::strip_result(&raw.log);
        debug!(variables = report.variables.len(), checks = report.checks.len(), "Collected snapshot");

        lifecycle.advance(RunState::Validating);
        let variables: Vec<String> = report.variables.keys().cloned().collect();
        let run_clean = report.error.is_none() && raw.exit_code == Some(0);
        let context = ExecutionContext::Data(DataContext {
            variables: report.variables,
            checks: report.checks,
            output: output.clone(),
        });
        let validation_results = evaluator::evaluate(&job.spec.validations, &context);

        lifecycle.advance(RunState::Scoring);
        let score = self.scoring.score(&ScoreInput {
            outcomes: &validation_results,
            run_clean,
            output: &output,
            variables: &variables,
            commands: &[],
        });

        lifecycle.begin_cleanup();
        Ok(TrackOutcome {
            validation_results,
            score,
            output,
            errors: report.error.into_iter().collect(),
            cloud: None,
        })
    }
}
