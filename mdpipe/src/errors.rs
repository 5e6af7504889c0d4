//! Error types for the pipeline execution engine.

use crate::context::AttemptRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Failure of one branch inside a parallel group.
///
/// Aggregated without masking: a failed branch never erases its successful
/// siblings' values.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("branch {index} failed: {message}")]
pub struct ParallelBranchError {
    /// Index of the failed branch within its group.
    pub index: usize,
    /// Name of the branch callable, when known.
    pub key: Option<String>,
    /// Human-readable failure message.
    pub message: String,
    /// The value the branch produced before failing, if any.
    pub value: Option<Value>,
}

impl ParallelBranchError {
    /// Creates an error for a failed branch.
    #[must_use]
    pub fn failed(index: usize, key: Option<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            key,
            message: message.into(),
            value: None,
        }
    }

    /// Creates an error for a branch cancelled by an abort.
    #[must_use]
    pub fn cancelled(index: usize) -> Self {
        Self {
            index,
            key: None,
            message: "branch cancelled".to_string(),
            value: None,
        }
    }

    /// Attaches the value the branch carried when it failed.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// The error taxonomy of the engine.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A stage callable failed or raised.
    #[error("stage {stage_index} failed: {message}")]
    StageExecution {
        /// The failing stage.
        stage_index: usize,
        /// What went wrong.
        message: String,
    },

    /// A stage exceeded its timeout budget.
    #[error("stage {stage_index} timed out after {timeout:?}")]
    StageTimeout {
        /// The failing stage.
        stage_index: usize,
        /// The exceeded budget.
        timeout: Duration,
    },

    /// A retry signal targeted a stage it may not target.
    #[error("retry targeting stage {target} not allowed: {reason}")]
    RetryNotAllowed {
        /// The requested target index (clamped to 0 for negative targets).
        target: usize,
        /// Why the retry was rejected.
        reason: String,
    },

    /// A retry would exceed the configured per-stage attempt ceiling.
    #[error("stage {stage_index} exceeded the attempt ceiling of {limit}")]
    RetryLimitExceeded {
        /// The stage that hit the ceiling.
        stage_index: usize,
        /// The configured ceiling.
        limit: u32,
    },

    /// One or more branches of a parallel group failed.
    ///
    /// `values` keeps the successful branches' outputs, ordered by branch
    /// index, with `None` at failed indices.
    #[error("parallel group at stage {stage_index}: {} branch(es) failed", errors.len())]
    ParallelGroup {
        /// The group's stage index.
        stage_index: usize,
        /// One error per failed branch.
        errors: Vec<ParallelBranchError>,
        /// Per-branch outputs for the branches that succeeded.
        values: Vec<Option<Value>>,
    },

    /// A stage combines an after-guard with streaming output.
    ///
    /// Raised at construction time: after-guards need a complete buffered
    /// output, which streaming does not guarantee incrementally.
    #[error("stage {stage_index} combines an after-guard with streaming output")]
    StreamingGuardConflict {
        /// The offending stage.
        stage_index: usize,
    },

    /// A malformed pipeline descriptor or adapter configuration.
    #[error("invalid pipeline configuration: {0}")]
    Configuration(String),

    /// The run was cancelled externally.
    #[error("pipeline aborted: {reason}")]
    Aborted {
        /// The abort reason.
        reason: String,
    },
}

impl PipelineError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn execution(stage_index: usize, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage_index,
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an abort error.
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Short kind name used in attempt records and events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageExecution { .. } => "stage_execution",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::RetryNotAllowed { .. } => "retry_not_allowed",
            Self::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            Self::ParallelGroup { .. } => "parallel_group",
            Self::StreamingGuardConflict { .. } => "streaming_guard_conflict",
            Self::Configuration(_) => "configuration",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// Returns true for `Aborted`, letting callers tell "cancelled" apart
    /// from "errored".
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// A terminal `Failed` (or `Aborted`) run, carrying the full per-stage
/// attempt history for diagnostics.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct RunFailure {
    /// The terminating error.
    #[source]
    pub error: PipelineError,
    /// Attempt history per stage, as accumulated up to termination.
    pub attempt_history: Vec<Vec<AttemptRecord>>,
}

impl RunFailure {
    /// Creates a run failure.
    #[must_use]
    pub fn new(error: PipelineError, attempt_history: Vec<Vec<AttemptRecord>>) -> Self {
        Self {
            error,
            attempt_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_error_display() {
        let err = ParallelBranchError::failed(1, Some("fetch".to_string()), "boom");
        assert_eq!(err.to_string(), "branch 1 failed: boom");
    }

    #[test]
    fn branch_error_keeps_value() {
        let err = ParallelBranchError::failed(0, None, "bad signal").with_value(json!({"x": 1}));
        assert_eq!(err.value, Some(json!({"x": 1})));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            PipelineError::execution(2, "nope").kind(),
            "stage_execution"
        );
        assert_eq!(PipelineError::aborted("user").kind(), "aborted");
        assert!(PipelineError::aborted("user").is_abort());
        assert!(!PipelineError::configuration("bad").is_abort());
    }

    #[test]
    fn parallel_group_display_counts_failures() {
        let err = PipelineError::ParallelGroup {
            stage_index: 1,
            errors: vec![
                ParallelBranchError::failed(0, None, "a"),
                ParallelBranchError::failed(2, None, "b"),
            ],
            values: vec![None, Some(json!("ok")), None],
        };
        assert!(err.to_string().contains("2 branch(es) failed"));
    }

    #[test]
    fn run_failure_exposes_source() {
        let failure = RunFailure::new(PipelineError::execution(0, "bad"), vec![Vec::new()]);
        assert_eq!(failure.to_string(), "stage 0 failed: bad");
        assert!(std::error::Error::source(&failure).is_some());
    }
}
