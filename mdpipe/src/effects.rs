//! Inline-effect scheduling.
//!
//! A stage may carry side-effecting actions (log/show/export) that run
//! synchronously, in declaration order, after each successful attempt of
//! that stage. Effects are replayed once per attempt and never
//! deduplicated across retries.

use crate::context::AmbientContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What an inline effect does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectKind {
    /// Emits a structured log line.
    Log {
        /// Message to log; defaults to the effect value's text.
        message: Option<String>,
    },
    /// Surfaces the effect value for display.
    Show,
    /// Writes the effect value into the run's exports under `name`.
    Export {
        /// Export key.
        name: String,
    },
}

/// One inline effect attached to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDescriptor {
    /// The effect's action.
    pub kind: EffectKind,
    /// Literal payload; when absent the attempt's output is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EffectDescriptor {
    /// A log effect with an explicit message.
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            kind: EffectKind::Log {
                message: Some(message.into()),
            },
            payload: None,
        }
    }

    /// A show effect surfacing the attempt output.
    #[must_use]
    pub fn show() -> Self {
        Self {
            kind: EffectKind::Show,
            payload: None,
        }
    }

    /// An export effect writing the attempt output under `name`.
    #[must_use]
    pub fn export(name: impl Into<String>) -> Self {
        Self {
            kind: EffectKind::Export { name: name.into() },
            payload: None,
        }
    }

    /// Overrides the effect value with a literal payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Record of one inline-effect execution, kept on the structured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredEffect {
    /// The stage the effect belongs to.
    pub stage_index: usize,
    /// The attempt that triggered this execution.
    pub attempt: u32,
    /// Effect kind name ("log", "show", "export").
    pub kind: String,
    /// The value the effect observed.
    pub value: Value,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
}

/// Runs a stage's inline effects after each successful attempt.
///
/// Accumulates the execution records and the export map for the final
/// structured result.
#[derive(Debug, Default)]
pub struct EffectScheduler {
    records: Vec<StructuredEffect>,
    exports: HashMap<String, Value>,
}

impl EffectScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `effects` in declaration order against one successful attempt.
    ///
    /// `ctx` is the attempt's own snapshot, so a retry hint targeted at
    /// this attempt is visible to its effects.
    pub fn run(&mut self, effects: &[EffectDescriptor], ctx: &AmbientContext, output: &Value) {
        for effect in effects {
            let value = effect.payload.clone().unwrap_or_else(|| output.clone());
            let kind = match &effect.kind {
                EffectKind::Log { message } => {
                    let rendered = message.clone().unwrap_or_else(|| value_text(&value));
                    tracing::info!(
                        stage = ctx.stage_index,
                        attempt = ctx.attempt_count,
                        command = %ctx.current_command,
                        "{rendered}"
                    );
                    "log"
                }
                EffectKind::Show => "show",
                EffectKind::Export { name } => {
                    self.exports.insert(name.clone(), value.clone());
                    "export"
                }
            };
            self.records.push(StructuredEffect {
                stage_index: ctx.stage_index,
                attempt: ctx.attempt_count,
                kind: kind.to_string(),
                value,
                timestamp: Utc::now(),
            });
        }
    }

    /// Executions recorded so far.
    #[must_use]
    pub fn records(&self) -> &[StructuredEffect] {
        &self.records
    }

    /// Consumes the scheduler into its records and export map.
    #[must_use]
    pub fn into_parts(self) -> (Vec<StructuredEffect>, HashMap<String, Value>) {
        (self.records, self.exports)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(stage: usize, attempt: u32, hint: Option<Value>) -> AmbientContext {
        AmbientContext {
            pipeline_id: Uuid::new_v4(),
            stage_index: stage,
            total_stages: 2,
            current_command: "cmd".to_string(),
            input: json!(null),
            previous_outputs: Vec::new(),
            attempt_count: attempt,
            attempt_history: Vec::new(),
            hint,
            hint_history: Vec::new(),
            source_retryable: false,
            active_guard_names: Vec::new(),
            parallel_index: None,
        }
    }

    #[test]
    fn effects_run_in_declaration_order() {
        let mut scheduler = EffectScheduler::new();
        let effects = vec![
            EffectDescriptor::log("first"),
            EffectDescriptor::show(),
            EffectDescriptor::export("result"),
        ];

        scheduler.run(&effects, &ctx(0, 1, None), &json!("out"));

        let kinds: Vec<_> = scheduler.records().iter().map(|r| r.kind.clone()).collect();
        assert_eq!(kinds, vec!["log", "show", "export"]);
    }

    #[test]
    fn export_writes_attempt_output_by_default() {
        let mut scheduler = EffectScheduler::new();
        scheduler.run(
            &[EffectDescriptor::export("answer")],
            &ctx(1, 1, None),
            &json!(42),
        );

        let (_, exports) = scheduler.into_parts();
        assert_eq!(exports.get("answer"), Some(&json!(42)));
    }

    #[test]
    fn literal_payload_overrides_output() {
        let mut scheduler = EffectScheduler::new();
        scheduler.run(
            &[EffectDescriptor::show().with_payload(json!("literal"))],
            &ctx(0, 1, None),
            &json!("ignored"),
        );
        assert_eq!(scheduler.records()[0].value, json!("literal"));
    }

    #[test]
    fn effects_replay_once_per_attempt() {
        let mut scheduler = EffectScheduler::new();
        let effects = vec![EffectDescriptor::export("latest")];

        scheduler.run(&effects, &ctx(0, 1, None), &json!("v1"));
        scheduler.run(&effects, &ctx(0, 2, Some(json!("again"))), &json!("v2"));

        assert_eq!(scheduler.records().len(), 2);
        assert_eq!(scheduler.records()[1].attempt, 2);
        let (_, exports) = scheduler.into_parts();
        // Last attempt wins the export slot.
        assert_eq!(exports.get("latest"), Some(&json!("v2")));
    }
}
