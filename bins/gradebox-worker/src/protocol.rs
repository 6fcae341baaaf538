/// Container I/O contract
///
/// **Input:** one JSON document passed as the container's single process
/// argument (`type`, `code`, optional `dataset`/`setup`/`commands`/`files`,
/// and the `validations` array).
///
/// **Output:** the in-container entrypoint prints one JSON object between
/// [`RESULT_BEGIN`] and [`RESULT_END`] on stdout. Images that predate the
/// delimiters are still read by scanning for the terminal JSON object.

use crate::engine::MAX_ARG_BYTES;
use crate::error::ExecutionError;
use gradebox_common::types::ValidationRule;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RESULT_BEGIN: &str = "@@GRADEBOX_RESULT_BEGIN@@";
pub const RESULT_END: &str = "@@GRADEBOX_RESULT_END@@";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
    pub validations: Vec<ValidationRule>,
}

impl ContainerPayload {
    pub fn new(kind: &str, code: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            code: code.into(),
            ..Default::default()
        }
    }

    /// Serialize for use as a process argument
    pub fn to_arg(&self) -> Result<String, ExecutionError> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| ExecutionError::ContainerLaunch(format!("payload encoding: {}", e)))?;

        if encoded.len() > MAX_ARG_BYTES {
            return Err(ExecutionError::ContainerLaunch(format!(
                "payload is {} bytes, limit is {}",
                encoded.len(),
                MAX_ARG_BYTES
            )));
        }
        Ok(encoded)
    }
}

/// Wrap a JSON document in the result delimiters
pub fn frame_result(json: &str) -> String {
    format!("{}\n{}\n{}\n", RESULT_BEGIN, json, RESULT_END)
}

/// Body of the last complete delimited block
fn delimited_block(stdout: &str) -> Option<&str> {
    let end = stdout.rfind(RESULT_END)?;
    let begin = stdout[..end].rfind(RESULT_BEGIN)?;
    Some(stdout[begin + RESULT_BEGIN.len()..end].trim())
}

/// Last JSON object that parses through to the end of the log
fn trailing_json_object(log: &str) -> Option<serde_json::Value> {
    let trimmed = log.trim_end();
    for (idx, _) in trimmed.match_indices('{').rev() {
        let candidate = &trimmed[idx..];
        if let Ok(value @ serde_json::Value::Object(_)) =
            serde_json::from_str::<serde_json::Value>(candidate)
        {
            return Some(value);
        }
    }
    None
}

/// Locate and decode the result document
pub fn parse_result<T: DeserializeOwned>(stdout: &str) -> Result<T, ExecutionError> {
    if let Some(block) = delimited_block(stdout) {
        return serde_json::from_str(block)
            .map_err(|e| ExecutionError::OutputParse(format!("malformed result block: {}", e)));
    }

    let value = trailing_json_object(stdout)
        .ok_or_else(|| ExecutionError::OutputParse("no result found in output".to_string()))?;

    serde_json::from_value(value)
        .map_err(|e| ExecutionError::OutputParse(format!("unexpected result shape: {}", e)))
}

/// Output with the result block removed, for display and marker scanning
pub fn strip_result(output: &str) -> String {
    let Some(end) = output.rfind(RESULT_END) else {
        return output.to_string();
    };
    let Some(begin) = output[..end].rfind(RESULT_BEGIN) else {
        return output.to_string();
    };

    let mut stripped = output[..begin].to_string();
    stripped.push_str(output[end + RESULT_END.len()..].trim_start_matches('\n'));
    stripped
}

/// Report printed by the web harness
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WebReport {
    #[serde(default)]
    pub tests: Vec<WebTestReport>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebTestReport {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

/// Snapshot of one top-level variable left by a data submission
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VariableSnapshot {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub shape: Option<Vec<u64>>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub length: Option<u64>,
}

impl VariableSnapshot {
    /// Rows of a frame or array, length of anything sized
    pub fn rows(&self) -> Option<u64> {
        self.shape
            .as_ref()
            .and_then(|s| s.first().copied())
            .or(self.length)
    }
}

/// Outcome of an expression evaluated inside the container
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckReport {
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

/// Report printed by the data introspection step
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataReport {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSnapshot>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckReport>,
    /// Traceback when the setup or submission raised
    #[serde(default)]
    pub error: Option<String>,
}
