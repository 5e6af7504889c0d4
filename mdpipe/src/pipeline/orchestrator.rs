//! The run loop: stage sequencing, retries, guards, effects, events.
//!
//! The orchestrator owns one run of one pipeline. It advances a cursor
//! over the stage list, dispatches each stage through the executor or the
//! branch coordinator, and interprets retry signals by moving the cursor
//! backwards and invalidating every output at or beyond the target.

use crate::cancel::CancellationToken;
use crate::context::{AttemptRecord, ContextProvider};
use crate::effects::EffectScheduler;
use crate::errors::{ParallelBranchError, PipelineError, RunFailure};
use crate::events::{
    FormatAdapter, FormatAdapterSink, ParsedEventConsumer, PlainTextAdapter, StreamBus,
    StreamEvent, StreamFormat, StreamSink,
};
use crate::guards::{GuardDecision, GuardEngine, NoopGuardEngine};
use crate::stage::{
    BranchCoordinator, ExecutorBackend, StageExecutor, StageReturn,
};
use super::descriptor::{
    ParallelFailureMode, Pipeline, RunOptions, StageKind,
};
use super::result::{StreamingSummary, StructuredResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Executing the given stage on the given attempt.
    Running { stage_index: usize, attempt: u32 },
    Succeeded,
    Failed,
    Aborted,
}

/// Drives one pipeline run to completion.
///
/// Each orchestrator carries its own [`StreamBus`]; concurrent runs never
/// share event state.
pub struct Orchestrator {
    pipeline: Pipeline,
    backend: Arc<dyn ExecutorBackend>,
    guards: Arc<dyn GuardEngine>,
    options: RunOptions,
    bus: Arc<StreamBus>,
    cancel: Arc<CancellationToken>,
    parsed_consumer: Option<Arc<dyn ParsedEventConsumer>>,
}

impl Orchestrator {
    /// Creates an orchestrator for one run of `pipeline`.
    #[must_use]
    pub fn new(pipeline: Pipeline, backend: Arc<dyn ExecutorBackend>) -> Self {
        Self {
            pipeline,
            backend,
            guards: Arc::new(NoopGuardEngine),
            options: RunOptions::default(),
            bus: Arc::new(StreamBus::new(Uuid::new_v4())),
            cancel: CancellationToken::new(),
            parsed_consumer: None,
        }
    }

    /// Installs a guard engine.
    #[must_use]
    pub fn with_guards(mut self, guards: Arc<dyn GuardEngine>) -> Self {
        self.guards = guards;
        self
    }

    /// Sets per-run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Forwards adapter-parsed events to `consumer` during the run.
    #[must_use]
    pub fn with_parsed_consumer(mut self, consumer: Arc<dyn ParsedEventConsumer>) -> Self {
        self.parsed_consumer = Some(consumer);
        self
    }

    /// Attaches a sink to this run's bus.
    pub fn attach_sink(&self, sink: Arc<dyn StreamSink>) {
        self.bus.sinks().attach(sink);
    }

    /// Token that aborts this run when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Runs the pipeline to a terminal state.
    ///
    /// The returned `output` is identical whether streaming was enabled,
    /// suppressed, or never configured; streaming only adds the summary.
    pub async fn run(self) -> Result<StructuredResult, RunFailure> {
        let pipeline_id = self.bus.pipeline_id();
        let total = self.pipeline.total_stages();
        info!(%pipeline_id, stages = total, "pipeline run started");

        if self.options.suppress_streaming {
            self.bus.suppress();
        }

        let adapter_sink = match self.attach_format_adapter() {
            Ok(sink) => sink,
            Err(err) => return Err(RunFailure::new(err, Vec::new())),
        };

        let mut provider = ContextProvider::new(
            pipeline_id,
            total,
            self.pipeline.source_retryable || self.pipeline.source_fn.is_some(),
        );
        let mut scheduler = EffectScheduler::new();
        let mut branch_errors: Vec<ParallelBranchError> = Vec::new();
        let mut outputs: Vec<Option<Value>> = vec![None; total];
        let mut current_input = self.pipeline.initial_input.clone();
        let mut idx = 0usize;

        let executor = StageExecutor::new(self.backend.clone(), self.bus.clone());
        let coordinator = BranchCoordinator::new(self.backend.clone(), self.bus.clone());

        self.bus.emit(StreamEvent::pipeline_start(pipeline_id, total));

        while idx < total {
            if self.cancel.is_cancelled() {
                let reason = self
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string());
                return Err(self.terminate(PipelineError::aborted(reason), &provider));
            }

            let stage = self.pipeline.stages[idx].clone();
            let attempt = provider.begin_attempt(idx);
            let hint = provider.take_hint(idx);
            let command = stage.command_label();
            let state = OrchestratorState::Running {
                stage_index: idx,
                attempt,
            };
            debug!(?state, command = %command, "stage attempt");

            let previous_outputs: Vec<Value> = outputs[..idx]
                .iter()
                .map(|v| v.clone().unwrap_or(Value::Null))
                .collect();
            let mut ctx = provider.snapshot(
                idx,
                command.clone(),
                current_input.clone(),
                previous_outputs,
                hint,
                stage.guards.names(),
            );

            if let Some(name) = &stage.guards.before {
                match self.guards.check_before(name, &current_input, &ctx).await {
                    GuardDecision::Allow => {}
                    GuardDecision::Replace(replacement) => {
                        debug!(guard = %name, stage = idx, "before-guard replaced input");
                        current_input = replacement.clone();
                        ctx.input = replacement;
                    }
                    GuardDecision::Deny(reason) => {
                        let err = PipelineError::execution(
                            idx,
                            format!("guard '{name}' denied stage input: {reason}"),
                        );
                        provider.record(
                            idx,
                            AttemptRecord::failure(
                                attempt,
                                current_input.clone(),
                                err.kind(),
                                err.to_string(),
                            ),
                        );
                        self.bus.emit(StreamEvent::stage_failure(
                            pipeline_id,
                            idx,
                            attempt,
                            err.to_string(),
                        ));
                        return Err(self.terminate(err, &provider));
                    }
                }
            }

            self.bus.emit(StreamEvent::stage_start(
                pipeline_id,
                idx,
                attempt,
                command,
            ));

            let dispatched = match stage.kind {
                StageKind::Sequential => {
                    executor
                        .run_stage(&stage, current_input.clone(), &ctx, &self.cancel)
                        .await
                }
                StageKind::ParallelGroup => {
                    match coordinator
                        .run_group(
                            &stage,
                            current_input.clone(),
                            &ctx,
                            self.cancel.clone(),
                            self.options.max_stage_attempts,
                        )
                        .await
                    {
                        Err(err) => Err(err),
                        Ok(outcome) if outcome.is_success() => {
                            Ok(StageReturn::Value(outcome.to_value()))
                        }
                        Ok(outcome) => match self.options.parallel_failure {
                            ParallelFailureMode::FailFast => Err(PipelineError::ParallelGroup {
                                stage_index: idx,
                                errors: outcome.errors,
                                values: outcome.values,
                            }),
                            ParallelFailureMode::Continue => {
                                warn!(
                                    stage = idx,
                                    failed = outcome.errors.len(),
                                    "parallel group proceeding past failed branches"
                                );
                                branch_errors.extend(outcome.errors.iter().cloned());
                                Ok(StageReturn::Value(outcome.to_value()))
                            }
                        },
                    }
                }
            };

            match dispatched {
                Err(err) => {
                    provider.record(
                        idx,
                        AttemptRecord::failure(
                            attempt,
                            ctx.input.clone(),
                            err.kind(),
                            err.to_string(),
                        ),
                    );
                    self.bus.emit(StreamEvent::stage_failure(
                        pipeline_id,
                        idx,
                        attempt,
                        err.to_string(),
                    ));
                    return Err(self.terminate(err, &provider));
                }
                Ok(StageReturn::Value(mut value)) => {
                    if let Some(name) = &stage.guards.after {
                        match self.guards.check_after(name, &value, &ctx).await {
                            GuardDecision::Allow => {}
                            GuardDecision::Replace(replacement) => {
                                debug!(guard = %name, stage = idx, "after-guard replaced output");
                                value = replacement;
                            }
                            GuardDecision::Deny(reason) => {
                                let err = PipelineError::execution(
                                    idx,
                                    format!("guard '{name}' denied stage output: {reason}"),
                                );
                                provider.record(
                                    idx,
                                    AttemptRecord::failure(
                                        attempt,
                                        ctx.input.clone(),
                                        err.kind(),
                                        err.to_string(),
                                    ),
                                );
                                self.bus.emit(StreamEvent::stage_failure(
                                    pipeline_id,
                                    idx,
                                    attempt,
                                    err.to_string(),
                                ));
                                return Err(self.terminate(err, &provider));
                            }
                        }
                    }

                    provider.record(
                        idx,
                        AttemptRecord::success(attempt, ctx.input.clone(), value.clone()),
                    );
                    scheduler.run(&stage.effects, &ctx, &value);
                    self.bus
                        .emit(StreamEvent::stage_success(pipeline_id, idx, attempt));

                    outputs[idx] = Some(value.clone());
                    current_input = value;
                    idx += 1;
                }
                Ok(StageReturn::Retry(signal)) => {
                    let requested = signal.from.unwrap_or(idx as i64);
                    if requested < 0 || requested > idx as i64 {
                        let err = PipelineError::RetryNotAllowed {
                            target: usize::try_from(requested).unwrap_or(0),
                            reason: format!(
                                "retry target {requested} is outside the completed range 0..={idx}"
                            ),
                        };
                        provider.record(
                            idx,
                            AttemptRecord::failure(
                                attempt,
                                ctx.input.clone(),
                                err.kind(),
                                err.to_string(),
                            ),
                        );
                        return Err(self.terminate(err, &provider));
                    }
                    let target = requested as usize;

                    if target == 0
                        && !self.pipeline.source_retryable
                        && self.pipeline.source_fn.is_none()
                    {
                        let err = PipelineError::RetryNotAllowed {
                            target,
                            reason: "the pipeline source is not retryable".to_string(),
                        };
                        provider.record(
                            idx,
                            AttemptRecord::failure(
                                attempt,
                                ctx.input.clone(),
                                err.kind(),
                                err.to_string(),
                            ),
                        );
                        return Err(self.terminate(err, &provider));
                    }

                    provider.record(
                        idx,
                        AttemptRecord::retry(attempt, ctx.input.clone(), signal.hint.clone()),
                    );

                    if let Some(limit) = self.options.max_stage_attempts {
                        if provider.attempt_count(target) >= limit {
                            let err = PipelineError::RetryLimitExceeded {
                                stage_index: target,
                                limit,
                            };
                            return Err(self.terminate(err, &provider));
                        }
                    }

                    debug!(from = idx, to = target, "retry signal accepted");
                    for slot in &mut outputs[target..=idx] {
                        *slot = None;
                    }
                    provider.set_hint(target, signal.hint);

                    current_input = if target == 0 {
                        match &self.pipeline.source_fn {
                            Some(source) => match source().await {
                                Ok(fresh) => fresh,
                                Err(err) => return Err(self.terminate(err, &provider)),
                            },
                            None => self.pipeline.initial_input.clone(),
                        }
                    } else {
                        outputs[target - 1].clone().unwrap_or(Value::Null)
                    };
                    idx = target;
                }
            }
        }

        self.bus.emit(StreamEvent::pipeline_complete(pipeline_id));
        self.bus.sinks().detach_all();
        info!(%pipeline_id, "pipeline run succeeded");

        let streaming = if self.bus.is_suppressed() {
            None
        } else {
            let accumulated = adapter_sink.as_ref().map_or_else(
                || {
                    self.bus
                        .recorded()
                        .iter()
                        .filter_map(StreamEvent::chunk_text)
                        .collect::<String>()
                },
                |sink| sink.accumulated(),
            );
            Some(StreamingSummary {
                accumulated,
                events: self.bus.recorded(),
            })
        };

        let output = outputs
            .pop()
            .flatten()
            .unwrap_or(Value::Null);
        let (effects, exports) = scheduler.into_parts();

        Ok(StructuredResult {
            output,
            effects,
            exports,
            streaming,
            branch_errors,
        })
    }

    /// Resolves the configured stream formats and attaches one adapter
    /// sink routing per stage.
    ///
    /// A stage-level format overrides the pipeline-level one for that
    /// stage's chunks; stages without their own format fall back to the
    /// pipeline format, or to plain text when only other stages set one.
    fn attach_format_adapter(&self) -> Result<Option<Arc<FormatAdapterSink>>, PipelineError> {
        if self.bus.is_suppressed() {
            return Ok(None);
        }
        let stage_formats: Vec<(usize, &StreamFormat)> = self
            .pipeline
            .stages
            .iter()
            .filter_map(|s| s.options.format.as_ref().map(|f| (s.index, f)))
            .collect();
        if self.pipeline.format.is_none() && stage_formats.is_empty() {
            return Ok(None);
        }

        let default: Arc<dyn FormatAdapter> = match &self.pipeline.format {
            Some(format) => format.resolve()?,
            None => Arc::new(PlainTextAdapter),
        };
        let mut sink = FormatAdapterSink::new(default);
        for (index, format) in stage_formats {
            sink = sink.with_stage_override(index, format.resolve()?);
        }
        if let Some(consumer) = &self.parsed_consumer {
            sink = sink.with_consumer(consumer.clone());
        }
        let sink = Arc::new(sink);
        self.bus.sinks().attach(sink.clone());
        Ok(Some(sink))
    }

    /// Terminal failure path: emits the abort event, detaches sinks once,
    /// and packages the attempt history.
    fn terminate(&self, error: PipelineError, provider: &ContextProvider) -> RunFailure {
        let state = if error.is_abort() {
            OrchestratorState::Aborted
        } else {
            OrchestratorState::Failed
        };
        info!(pipeline_id = %self.bus.pipeline_id(), ?state, error = %error, "pipeline run terminated");
        self.bus.emit(StreamEvent::pipeline_abort(
            self.bus.pipeline_id(),
            error.to_string(),
        ));
        self.bus.sinks().detach_all();
        RunFailure::new(error, provider.full_history())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
