//! Parallel branch coordination.
//!
//! A parallel-group stage fans out into K concurrent branch tasks and
//! joins them all before the group settles (join-all, never
//! first-to-finish). Aggregate values are ordered by branch index; a
//! failed branch contributes a [`ParallelBranchError`] without erasing its
//! successful siblings.

use super::backend::{CallableRef, ChunkRelay, ExecutorBackend};
use super::executor::{classify_return, StageReturn};
use crate::cancel::CancellationToken;
use crate::context::AmbientContext;
use crate::errors::{ParallelBranchError, PipelineError};
use crate::events::StreamBus;
use crate::pipeline::StageDescriptor;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Settled state of one parallel group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    /// Per-branch outputs, ordered by branch index; `None` where a branch
    /// failed.
    pub values: Vec<Option<Value>>,
    /// One error per failed branch.
    pub errors: Vec<ParallelBranchError>,
}

impl GroupOutcome {
    /// Returns true when every branch succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Folds the outcome into a JSON array: successes in place, `null` at
    /// failed indices.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Array(
            self.values
                .iter()
                .map(|v| v.clone().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// Runs a parallel-group stage's branches and joins them.
pub struct BranchCoordinator {
    backend: Arc<dyn ExecutorBackend>,
    bus: Arc<StreamBus>,
}

impl BranchCoordinator {
    /// Creates a coordinator over a backend and the run's bus.
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutorBackend>, bus: Arc<StreamBus>) -> Self {
        Self { backend, bus }
    }

    /// Runs every branch of `stage` concurrently and joins them all.
    ///
    /// An abort cancels all outstanding branches immediately and surfaces
    /// as `Aborted` without waiting for their natural completion.
    pub async fn run_group(
        &self,
        stage: &StageDescriptor,
        input: Value,
        base_ctx: &AmbientContext,
        cancel: Arc<CancellationToken>,
        max_attempts: Option<u32>,
    ) -> Result<GroupOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::aborted(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }

        let handles: Vec<_> = stage
            .callables
            .iter()
            .enumerate()
            .map(|(index, callable)| {
                let backend = self.backend.clone();
                let callable = callable.clone();
                let input = input.clone();
                let ctx = base_ctx.for_branch(index, callable.name.clone());
                let relay = stage
                    .options
                    .stream
                    .then(|| ChunkRelay::new(self.bus.clone(), stage.index, Some(index)));
                let budget = stage.options.timeout;
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => Err(ParallelBranchError::cancelled(index)),
                        result = run_branch(
                            backend, callable, input, ctx, relay, budget, cancel.clone(),
                            index, max_attempts,
                        ) => result,
                    }
                })
            })
            .collect();

        let settled = join_all(handles).await;

        if cancel.is_cancelled() {
            return Err(PipelineError::aborted(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }

        let mut values = Vec::with_capacity(settled.len());
        let mut errors = Vec::new();
        for (index, joined) in settled.into_iter().enumerate() {
            match joined {
                Ok(Ok(value)) => values.push(Some(value)),
                Ok(Err(err)) => {
                    values.push(None);
                    errors.push(err);
                }
                Err(join_err) => {
                    values.push(None);
                    errors.push(ParallelBranchError::failed(
                        index,
                        None,
                        format!("branch task panicked: {join_err}"),
                    ));
                }
            }
        }

        Ok(GroupOutcome { values, errors })
    }
}

impl std::fmt::Debug for BranchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchCoordinator").finish_non_exhaustive()
    }
}

/// One branch: a self-contained mini-invocation with a local retry loop.
///
/// A retry signal without `from` re-invokes the same branch with the hint
/// visible; `from` has no meaning inside a branch and fails it.
#[allow(clippy::too_many_arguments)]
async fn run_branch(
    backend: Arc<dyn ExecutorBackend>,
    callable: CallableRef,
    input: Value,
    mut ctx: AmbientContext,
    relay: Option<ChunkRelay>,
    budget: Option<Duration>,
    cancel: Arc<CancellationToken>,
    index: usize,
    max_attempts: Option<u32>,
) -> Result<Value, ParallelBranchError> {
    let key = Some(callable.name.clone());
    loop {
        let fut = backend.invoke(
            callable.clone(),
            input.clone(),
            ctx.clone(),
            relay.clone(),
            cancel.clone(),
        );
        let raw = match budget {
            Some(budget) => timeout(budget, fut).await.map_err(|_| {
                ParallelBranchError::failed(
                    index,
                    key.clone(),
                    format!("branch timed out after {budget:?}"),
                )
            })?,
            None => fut.await,
        }
        .map_err(|err| ParallelBranchError::failed(index, key.clone(), err.to_string()))?;

        match classify_return(raw) {
            StageReturn::Value(value) => return Ok(value),
            StageReturn::Retry(signal) => {
                if signal.from.is_some() {
                    return Err(ParallelBranchError::failed(
                        index,
                        key,
                        "retry 'from' cannot target outside a parallel branch",
                    )
                    .with_value(signal.hint.unwrap_or(Value::Null)));
                }
                if let Some(limit) = max_attempts {
                    if ctx.attempt_count >= limit {
                        return Err(ParallelBranchError::failed(
                            index,
                            key,
                            format!("branch exceeded the attempt ceiling of {limit}"),
                        ));
                    }
                }
                ctx.attempt_count += 1;
                ctx.hint_history
                    .push(signal.hint.clone().unwrap_or(Value::Null));
                ctx.hint = signal.hint;
            }
        }
    }
}
