//! Guard-engine collaborator contract.
//!
//! The policy logic itself lives outside the engine; the core treats guard
//! outcomes as opaque allow/deny/replace signals and enforces exactly one
//! structural rule, at construction time: a stage cannot combine an
//! after-guard with streaming output.

use crate::context::AmbientContext;
use async_trait::async_trait;
use serde_json::Value;

/// Outcome of one guard check.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// The value passes unchanged.
    Allow,
    /// The value is replaced before use.
    Replace(Value),
    /// The stage is rejected with a reason.
    Deny(String),
}

/// External policy engine checked before and after stage execution.
#[async_trait]
pub trait GuardEngine: Send + Sync {
    /// Checks a stage's input before execution.
    async fn check_before(
        &self,
        guard: &str,
        input: &Value,
        ctx: &AmbientContext,
    ) -> GuardDecision;

    /// Checks a stage's complete buffered output after execution.
    async fn check_after(
        &self,
        guard: &str,
        output: &Value,
        ctx: &AmbientContext,
    ) -> GuardDecision;
}

/// Guard engine that allows everything; the default collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGuardEngine;

#[async_trait]
impl GuardEngine for NoopGuardEngine {
    async fn check_before(
        &self,
        _guard: &str,
        _input: &Value,
        _ctx: &AmbientContext,
    ) -> GuardDecision {
        GuardDecision::Allow
    }

    async fn check_after(
        &self,
        _guard: &str,
        _output: &Value,
        _ctx: &AmbientContext,
    ) -> GuardDecision {
        GuardDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> AmbientContext {
        AmbientContext {
            pipeline_id: Uuid::new_v4(),
            stage_index: 0,
            total_stages: 1,
            current_command: "cmd".to_string(),
            input: json!(null),
            previous_outputs: Vec::new(),
            attempt_count: 1,
            attempt_history: Vec::new(),
            hint: None,
            hint_history: Vec::new(),
            source_retryable: false,
            active_guard_names: Vec::new(),
            parallel_index: None,
        }
    }

    #[tokio::test]
    async fn noop_engine_allows_everything() {
        let engine = NoopGuardEngine;
        let ctx = ctx();
        assert_eq!(
            engine.check_before("any", &json!("x"), &ctx).await,
            GuardDecision::Allow
        );
        assert_eq!(
            engine.check_after("any", &json!("y"), &ctx).await,
            GuardDecision::Allow
        );
    }
}
