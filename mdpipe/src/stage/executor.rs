//! Sequential stage execution and return-value classification.

use super::backend::{ChunkRelay, ExecutorBackend};
use crate::cancel::CancellationToken;
use crate::context::AmbientContext;
use crate::errors::PipelineError;
use crate::events::StreamBus;
use crate::pipeline::StageDescriptor;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::timeout;

/// A stage-directed retry request.
///
/// `from` may point at an earlier stage; `None` retries the signalling
/// stage itself. Negative `from` values are representable so the
/// orchestrator can reject them explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySignal {
    /// Hint payload for the retried stage's next attempt.
    pub hint: Option<Value>,
    /// Requested retry target, defaulting to the signalling stage.
    pub from: Option<i64>,
}

/// A classified stage return: a normal value or a retry signal.
#[derive(Debug, Clone, PartialEq)]
pub enum StageReturn {
    /// A normal output value.
    Value(Value),
    /// An explicit retry request.
    Retry(RetrySignal),
}

/// Classifies a raw backend return value.
///
/// A retry signal is a JSON object whose `value` field is the string
/// `"retry"` — distinguished by tag, never by coercion. Everything else,
/// including objects that merely mention retries, is a normal value.
#[must_use]
pub fn classify_return(raw: Value) -> StageReturn {
    match raw {
        Value::Object(obj) if obj.get("value").and_then(Value::as_str) == Some("retry") => {
            StageReturn::Retry(RetrySignal {
                hint: obj.get("hint").cloned(),
                from: obj.get("from").and_then(Value::as_i64),
            })
        }
        other => StageReturn::Value(other),
    }
}

/// Invokes one sequential stage's callable and classifies the result.
///
/// Owns the per-stage timeout budget and the streaming relay; a stage
/// occupies the orchestrator exclusively until it settles.
pub struct StageExecutor {
    backend: Arc<dyn ExecutorBackend>,
    bus: Arc<StreamBus>,
}

impl StageExecutor {
    /// Creates an executor over a backend and the run's bus.
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutorBackend>, bus: Arc<StreamBus>) -> Self {
        Self { backend, bus }
    }

    /// Runs one attempt of a sequential stage.
    pub async fn run_stage(
        &self,
        stage: &StageDescriptor,
        input: Value,
        ctx: &AmbientContext,
        cancel: &Arc<CancellationToken>,
    ) -> Result<StageReturn, PipelineError> {
        let callable = stage.callables[0].clone();
        let relay = stage
            .options
            .stream
            .then(|| ChunkRelay::new(self.bus.clone(), stage.index, None));

        let fut = self
            .backend
            .invoke(callable, input, ctx.clone(), relay, cancel.clone());

        let raw = match stage.options.timeout {
            Some(budget) => timeout(budget, fut).await.map_err(|_| {
                PipelineError::StageTimeout {
                    stage_index: stage.index,
                    timeout: budget,
                }
            })??,
            None => fut.await?,
        };

        Ok(classify_return(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::backend::{CallableRef, FnBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx(stage: usize) -> AmbientContext {
        AmbientContext {
            pipeline_id: Uuid::new_v4(),
            stage_index: stage,
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

    #[test]
    fn classify_normal_values() {
        assert_eq!(
            classify_return(json!("hello")),
            StageReturn::Value(json!("hello"))
        );
        assert_eq!(
            classify_return(json!({"value": "ok"})),
            StageReturn::Value(json!({"value": "ok"}))
        );
        // Mentioning "retry" outside the tag is not a signal.
        assert_eq!(
            classify_return(json!({"note": "retry"})),
            StageReturn::Value(json!({"note": "retry"}))
        );
    }

    #[test]
    fn classify_retry_signal() {
        let classified = classify_return(json!({"value": "retry", "hint": {"n": 2}, "from": 0}));
        match classified {
            StageReturn::Retry(signal) => {
                assert_eq!(signal.hint, Some(json!({"n": 2})));
                assert_eq!(signal.from, Some(0));
            }
            StageReturn::Value(v) => panic!("expected retry, got {v}"),
        }
    }

    #[test]
    fn classify_bare_retry_signal() {
        let classified = classify_return(json!({"value": "retry"}));
        assert_eq!(
            classified,
            StageReturn::Retry(RetrySignal {
                hint: None,
                from: None
            })
        );
    }

    #[tokio::test]
    async fn timeout_produces_stage_timeout() {
        struct Slow;

        #[async_trait]
        impl ExecutorBackend for Slow {
            async fn invoke(
                &self,
                _callable: CallableRef,
                _input: Value,
                _ctx: AmbientContext,
                _relay: Option<ChunkRelay>,
                _cancel: Arc<CancellationToken>,
            ) -> Result<Value, PipelineError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }
        }

        let bus = Arc::new(StreamBus::new(Uuid::new_v4()));
        let executor = StageExecutor::new(Arc::new(Slow), bus);
        let stage = StageDescriptor::sequential(0, CallableRef::new("slow"))
            .with_timeout(Duration::from_millis(10));

        let err = executor
            .run_stage(&stage, json!(null), &ctx(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageTimeout { stage_index: 0, .. }));
    }

    #[tokio::test]
    async fn streaming_stage_gets_a_relay() {
        let backend = FnBackend::new().with("emit", |_c, _i, _x, relay| {
            let relay = relay.expect("streaming stage must carry a relay");
            relay.push("chunk-1");
            relay.push("chunk-2");
            Ok(json!("done"))
        });

        let bus = Arc::new(StreamBus::new(Uuid::new_v4()));
        let executor = StageExecutor::new(Arc::new(backend), bus.clone());
        let stage = StageDescriptor::sequential(0, CallableRef::new("emit")).streamed();

        let result = executor
            .run_stage(&stage, json!(null), &ctx(0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, StageReturn::Value(json!("done")));
        assert_eq!(bus.recorded().len(), 2);
    }

    #[tokio::test]
    async fn non_streaming_stage_has_no_relay() {
        let backend = FnBackend::new().with("plain", |_c, _i, _x, relay| {
            assert!(relay.is_none());
            Ok(json!(1))
        });
        let bus = Arc::new(StreamBus::new(Uuid::new_v4()));
        let executor = StageExecutor::new(Arc::new(backend), bus);
        let stage = StageDescriptor::sequential(0, CallableRef::new("plain"));

        executor
            .run_stage(&stage, json!(null), &ctx(0), &CancellationToken::new())
            .await
            .unwrap();
    }
}
