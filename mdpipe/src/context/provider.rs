//! Builds ambient snapshots from per-run attempt state.

use super::{AmbientContext, AttemptRecord};
use serde_json::Value;
use uuid::Uuid;

/// Owns the mutable per-run attempt state and produces immutable
/// [`AmbientContext`] snapshots from it.
///
/// The hint visibility rule lives here: a hint set by a retry signal is
/// handed out exactly once, to the next attempt of the targeted stage, and
/// cleared before any later attempt unless a new retry re-targets it.
#[derive(Debug)]
pub struct ContextProvider {
    pipeline_id: Uuid,
    total_stages: usize,
    source_retryable: bool,
    attempts: Vec<u32>,
    histories: Vec<Vec<AttemptRecord>>,
    live_hints: Vec<Option<Value>>,
    hint_history: Vec<Value>,
}

impl ContextProvider {
    /// Creates a provider for a run over `total_stages` stages.
    #[must_use]
    pub fn new(pipeline_id: Uuid, total_stages: usize, source_retryable: bool) -> Self {
        Self {
            pipeline_id,
            total_stages,
            source_retryable,
            attempts: vec![0; total_stages],
            histories: vec![Vec::new(); total_stages],
            live_hints: vec![None; total_stages],
            hint_history: Vec::new(),
        }
    }

    /// Starts a new attempt of `stage` and returns its 1-based number.
    pub fn begin_attempt(&mut self, stage: usize) -> u32 {
        self.attempts[stage] += 1;
        self.attempts[stage]
    }

    /// Takes the live hint for `stage`, clearing it.
    pub fn take_hint(&mut self, stage: usize) -> Option<Value> {
        self.live_hints[stage].take()
    }

    /// Arms `stage` with a retry hint and records it in the history.
    ///
    /// A retry without a hint still contributes a `null` entry so the
    /// history reflects every retry signal.
    pub fn set_hint(&mut self, stage: usize, hint: Option<Value>) {
        self.hint_history
            .push(hint.clone().unwrap_or(Value::Null));
        self.live_hints[stage] = hint;
    }

    /// Appends an attempt record for `stage`.
    pub fn record(&mut self, stage: usize, record: AttemptRecord) {
        self.histories[stage].push(record);
    }

    /// Cumulative attempt count for `stage`.
    #[must_use]
    pub fn attempt_count(&self, stage: usize) -> u32 {
        self.attempts[stage]
    }

    /// Full per-stage attempt history, for failure diagnostics.
    #[must_use]
    pub fn full_history(&self) -> Vec<Vec<AttemptRecord>> {
        self.histories.clone()
    }

    /// Builds the snapshot one attempt (and its inline effects) observes.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn snapshot(
        &self,
        stage: usize,
        command: impl Into<String>,
        input: Value,
        previous_outputs: Vec<Value>,
        hint: Option<Value>,
        active_guard_names: Vec<String>,
    ) -> AmbientContext {
        AmbientContext {
            pipeline_id: self.pipeline_id,
            stage_index: stage,
            total_stages: self.total_stages,
            current_command: command.into(),
            input,
            previous_outputs,
            attempt_count: self.attempts[stage],
            attempt_history: self.histories[stage].clone(),
            hint,
            hint_history: self.hint_history.clone(),
            source_retryable: self.source_retryable,
            active_guard_names,
            parallel_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> ContextProvider {
        ContextProvider::new(Uuid::new_v4(), 3, false)
    }

    #[test]
    fn attempts_accumulate_per_stage() {
        let mut p = provider();
        assert_eq!(p.begin_attempt(1), 1);
        assert_eq!(p.begin_attempt(1), 2);
        assert_eq!(p.begin_attempt(0), 1);
        assert_eq!(p.attempt_count(1), 2);
    }

    #[test]
    fn hint_is_handed_out_once() {
        let mut p = provider();
        p.set_hint(1, Some(json!("try harder")));

        assert_eq!(p.take_hint(1), Some(json!("try harder")));
        assert_eq!(p.take_hint(1), None);
        // Other stages never see it.
        assert_eq!(p.take_hint(0), None);
    }

    #[test]
    fn hint_history_records_hintless_retries() {
        let mut p = provider();
        p.set_hint(2, None);
        p.set_hint(0, Some(json!(1)));

        let ctx = p.snapshot(0, "cmd", json!(null), Vec::new(), None, Vec::new());
        assert_eq!(ctx.hint_history, vec![json!(null), json!(1)]);
    }

    #[test]
    fn snapshot_reflects_stage_state() {
        let mut p = provider();
        p.begin_attempt(1);
        p.record(1, AttemptRecord::retry(1, json!("a"), None));
        p.begin_attempt(1);

        let ctx = p.snapshot(
            1,
            "upper",
            json!("a"),
            vec![json!("stage0-out")],
            Some(json!("hint")),
            vec!["before-guard".to_string()],
        );

        assert_eq!(ctx.attempt_count, 2);
        assert_eq!(ctx.attempt_history.len(), 1);
        assert_eq!(ctx.previous_outputs, vec![json!("stage0-out")]);
        assert_eq!(ctx.active_guard_names, vec!["before-guard".to_string()]);
        assert!(ctx.is_retry_attempt());
    }
}
