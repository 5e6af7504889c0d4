//! Immutable ambient snapshots and attempt bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How one execution of a stage settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt produced a normal output value.
    Success {
        /// The output value.
        output: Value,
    },
    /// The attempt signalled a retry.
    Retry {
        /// The hint payload carried by the retry signal.
        hint: Option<Value>,
    },
    /// The attempt failed with an unrecoverable error.
    Failure {
        /// Short error kind name (e.g. "stage_execution", "stage_timeout").
        error_kind: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Record of one actual stage invocation.
///
/// Appended exactly once per invocation, including retries; never
/// retroactively edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// The 1-based attempt number for this stage.
    pub attempt: u32,
    /// The input the attempt observed.
    pub input: Value,
    /// How the attempt settled.
    pub outcome: AttemptOutcome,
    /// When the attempt settled.
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    /// Creates a record for a successful attempt.
    #[must_use]
    pub fn success(attempt: u32, input: Value, output: Value) -> Self {
        Self {
            attempt,
            input,
            outcome: AttemptOutcome::Success { output },
            timestamp: Utc::now(),
        }
    }

    /// Creates a record for a retry-signalling attempt.
    #[must_use]
    pub fn retry(attempt: u32, input: Value, hint: Option<Value>) -> Self {
        Self {
            attempt,
            input,
            outcome: AttemptOutcome::Retry { hint },
            timestamp: Utc::now(),
        }
    }

    /// Creates a record for a failed attempt.
    #[must_use]
    pub fn failure(
        attempt: u32,
        input: Value,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            input,
            outcome: AttemptOutcome::Failure {
                error_kind: kind.into(),
                message: message.into(),
            },
            timestamp: Utc::now(),
        }
    }

    /// Returns true if this attempt produced a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }
}

/// The read-only snapshot observed by one stage attempt and its inline
/// effects.
///
/// `hint` is non-null only for the attempt immediately following a retry
/// that targeted this stage; `hint_history` is always visible and records
/// every hint that has been signalled during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientContext {
    /// Correlation id of the owning pipeline run.
    pub pipeline_id: Uuid,
    /// Index of the executing stage.
    pub stage_index: usize,
    /// Total number of stages in the pipeline.
    pub total_stages: usize,
    /// Name of the callable being invoked.
    pub current_command: String,
    /// The input for this attempt.
    pub input: Value,
    /// Outputs of the stages completed so far in the current (fresh) run.
    pub previous_outputs: Vec<Value>,
    /// Cumulative number of attempts of this stage, including this one.
    pub attempt_count: u32,
    /// Full attempt history of this stage.
    pub attempt_history: Vec<AttemptRecord>,
    /// Live hint for this attempt, if this stage is the current retry target.
    pub hint: Option<Value>,
    /// Every hint signalled so far, in emission order.
    pub hint_history: Vec<Value>,
    /// Whether the pipeline source can be re-invoked for stage-0 retries.
    pub source_retryable: bool,
    /// Names of the guards active for this stage.
    pub active_guard_names: Vec<String>,
    /// Branch index when executing inside a parallel group.
    pub parallel_index: Option<usize>,
}

impl AmbientContext {
    /// Returns true if this attempt is re-executing as a retry target.
    #[must_use]
    pub fn is_retry_attempt(&self) -> bool {
        self.hint.is_some() || self.attempt_count > 1
    }

    /// Returns a copy of this snapshot re-targeted at one parallel branch.
    #[must_use]
    pub fn for_branch(&self, index: usize, command: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.parallel_index = Some(index);
        ctx.current_command = command.into();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attempt_record_success() {
        let record = AttemptRecord::success(1, json!("in"), json!("out"));
        assert!(record.is_success());
        assert_eq!(record.attempt, 1);
    }

    #[test]
    fn attempt_record_retry_carries_hint() {
        let record = AttemptRecord::retry(2, json!("in"), Some(json!({"why": "stale"})));
        match record.outcome {
            AttemptOutcome::Retry { ref hint } => {
                assert_eq!(hint.as_ref().unwrap()["why"], "stale");
            }
            ref other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn outcome_serialization_is_tagged() {
        let record = AttemptRecord::failure(3, json!(null), "stage_timeout", "too slow");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"]["kind"], "failure");
        assert_eq!(value["outcome"]["error_kind"], "stage_timeout");
        assert_eq!(value["outcome"]["message"], "too slow");

        let round: AttemptRecord = serde_json::from_value(value).unwrap();
        assert_eq!(round, record);
    }

    #[test]
    fn branch_snapshot_is_independent() {
        let ctx = AmbientContext {
            pipeline_id: Uuid::new_v4(),
            stage_index: 1,
            total_stages: 3,
            current_command: "group".to_string(),
            input: json!("x"),
            previous_outputs: vec![json!("a")],
            attempt_count: 1,
            attempt_history: Vec::new(),
            hint: None,
            hint_history: Vec::new(),
            source_retryable: false,
            active_guard_names: Vec::new(),
            parallel_index: None,
        };

        let branch = ctx.for_branch(2, "branch-cmd");
        assert_eq!(branch.parallel_index, Some(2));
        assert_eq!(branch.current_command, "branch-cmd");
        assert_eq!(ctx.parallel_index, None);
    }
}
