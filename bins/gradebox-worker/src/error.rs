// Error taxonomy for a single execution.
// Everything here is folded into a failed ExecutionResult by the executor.

use gradebox_common::types::ExecutionStatus;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    /// Unknown challenge, unsupported track or sub-type, malformed rules
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Docker daemon unreachable or not answering
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Image missing, create/start rejected by the daemon
    #[error("container launch failed: {0}")]
    ContainerLaunch(String),

    /// The submission's own process failed
    #[error("container exited with code {exit_code:?}: {message}")]
    ContainerRuntime {
        exit_code: Option<i64>,
        message: String,
    },

    /// Wall-clock budget exceeded
    #[error("execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The result channel was missing or malformed
    #[error("failed to parse execution result: {0}")]
    OutputParse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    RuntimeUnavailable,
    ContainerLaunch,
    ContainerRuntime,
    Timeout,
    OutputParse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::ContainerLaunch => "container_launch",
            ErrorKind::ContainerRuntime => "container_runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::OutputParse => "output_parse",
        }
    }
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Configuration(_) => ErrorKind::Configuration,
            ExecutionError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            ExecutionError::ContainerLaunch(_) => ErrorKind::ContainerLaunch,
            ExecutionError::ContainerRuntime { .. } => ErrorKind::ContainerRuntime,
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::OutputParse(_) => ErrorKind::OutputParse,
        }
    }

    /// Status recorded on the failed result
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionError::Timeout { .. } => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// Non-fatal problem during teardown. Never flips `success`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning(pub String);

impl CleanupWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup warning: {}", self.0)
    }
}
