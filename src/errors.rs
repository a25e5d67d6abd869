//! Typed error hierarchy for the conductor.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError`: configuration and prerequisite failures that abort a run
//! - `PhaseError`: per-phase execution failures, recorded and never thrown out of the engine
//! - `StateError`: workflow state document failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a run before any phase executes.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Required binary '{name}' was not found on PATH")]
    MissingBinary { name: String },

    #[error("Invalid flag: {0}")]
    InvalidFlag(String),

    #[error("No issues given to run")]
    EmptyIssueList,

    #[error("Unknown execution mode '{0}'. Valid values: sequential, fan-out")]
    UnknownExecutionMode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single phase execution.
///
/// The `Display` form is what gets persisted into a phase record's `error`
/// field, so every variant names the issue and the phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Issue #{issue} phase '{phase}' timed out after {timeout_secs}s")]
    Timeout {
        issue: u64,
        phase: String,
        timeout_secs: u64,
    },

    #[error("Issue #{issue} phase '{phase}' exited with non-zero code {exit_code}")]
    NonZeroExit {
        issue: u64,
        phase: String,
        exit_code: i32,
    },

    #[error("Issue #{issue} phase '{phase}' failed to spawn agent: {message}")]
    SpawnFailed {
        issue: u64,
        phase: String,
        message: String,
    },

    #[error("Issue #{issue} phase '{phase}' was cancelled")]
    Cancelled { issue: u64, phase: String },
}

impl PhaseError {
    /// Short failure reason without the issue/phase prefix.
    pub fn reason(&self) -> String {
        match self {
            PhaseError::Timeout { .. } => "timeout".to_string(),
            PhaseError::NonZeroExit { exit_code, .. } => format!("exit code {}", exit_code),
            PhaseError::SpawnFailed { message, .. } => format!("spawn failed: {}", message),
            PhaseError::Cancelled { .. } => "cancelled".to_string(),
        }
    }

    pub fn issue(&self) -> u64 {
        match self {
            PhaseError::Timeout { issue, .. }
            | PhaseError::NonZeroExit { issue, .. }
            | PhaseError::SpawnFailed { issue, .. }
            | PhaseError::Cancelled { issue, .. } => *issue,
        }
    }

    pub fn phase(&self) -> &str {
        match self {
            PhaseError::Timeout { phase, .. }
            | PhaseError::NonZeroExit { phase, .. }
            | PhaseError::SpawnFailed { phase, .. }
            | PhaseError::Cancelled { phase, .. } => phase,
        }
    }

    /// Whether a quality loop may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PhaseError::NonZeroExit { .. })
    }
}

/// Errors from the workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State document at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State document at {path} has schema version {found}, expected {expected}")]
    SchemaMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("State document at {path} is invalid: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Issue #{issue} not found in workflow state")]
    IssueNotFound { issue: u64 },

    #[error("Acceptance criterion '{id}' not found on issue #{issue}")]
    CriterionNotFound { issue: u64, id: String },

    #[error("State I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_error_timeout_reason_is_timeout() {
        let err = PhaseError::Timeout {
            issue: 12,
            phase: "exec".into(),
            timeout_secs: 30,
        };
        assert_eq!(err.reason(), "timeout");
        assert!(err.to_string().contains("#12"));
        assert!(err.to_string().contains("exec"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn phase_error_non_zero_exit_surfaces_code() {
        let err = PhaseError::NonZeroExit {
            issue: 3,
            phase: "qa".into(),
            exit_code: 2,
        };
        assert_eq!(err.reason(), "exit code 2");
        assert!(err.to_string().contains("non-zero code 2"));
        assert_eq!(err.issue(), 3);
        assert_eq!(err.phase(), "qa");
        assert!(err.is_retryable());
    }

    #[test]
    fn phase_error_spawn_failed_keeps_message() {
        let err = PhaseError::SpawnFailed {
            issue: 1,
            phase: "spec".into(),
            message: "No such file or directory".into(),
        };
        assert!(err.reason().starts_with("spawn failed"));
        assert!(err.to_string().contains("No such file or directory"));
    }

    #[test]
    fn state_error_issue_not_found_carries_number() {
        let err = StateError::IssueNotFound { issue: 42 };
        match &err {
            StateError::IssueNotFound { issue } => assert_eq!(*issue, 42),
            _ => panic!("Expected IssueNotFound"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn orchestrator_error_missing_binary_names_binary() {
        let err = OrchestratorError::MissingBinary {
            name: "claude".into(),
        };
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::EmptyIssueList);
        assert_std_error(&PhaseError::Cancelled {
            issue: 1,
            phase: "x".into(),
        });
        assert_std_error(&StateError::IssueNotFound { issue: 1 });
    }
}
