//! Executor-backend contract and chunk relay.
//!
//! Actual execution (in-process call, spawned process, sandboxed
//! interpreter) lives behind [`ExecutorBackend`]; the engine only hands it
//! a callable, an input, an ambient snapshot, and — for streaming stages —
//! a [`ChunkRelay`] to push raw output fragments through.

use crate::cancel::CancellationToken;
use crate::context::AmbientContext;
use crate::errors::PipelineError;
use crate::events::{StreamBus, StreamEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Reference to a resolvable unit of work.
///
/// Resolution to an invocable is the backend's business; the engine only
/// threads the reference through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableRef {
    /// Callable name.
    pub name: String,
    /// Pre-bound arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl CallableRef {
    /// Creates a callable reference by name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Adds pre-bound arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Forwards raw output chunks from a running stage to the stream bus.
///
/// Chunk order within one relay is the push order; across parallel
/// branches, chunks interleave by arrival and carry this relay's
/// `parallel_index`.
#[derive(Clone)]
pub struct ChunkRelay {
    bus: Arc<StreamBus>,
    stage_index: usize,
    parallel_index: Option<usize>,
}

impl ChunkRelay {
    /// Creates a relay for one stage (or one branch of a group).
    #[must_use]
    pub fn new(bus: Arc<StreamBus>, stage_index: usize, parallel_index: Option<usize>) -> Self {
        Self {
            bus,
            stage_index,
            parallel_index,
        }
    }

    /// Pushes one raw chunk onto the bus.
    pub fn push(&self, text: impl Into<String>) {
        self.bus.emit(StreamEvent::chunk(
            self.bus.pipeline_id(),
            self.stage_index,
            self.parallel_index,
            text,
        ));
    }
}

impl std::fmt::Debug for ChunkRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRelay")
            .field("stage_index", &self.stage_index)
            .field("parallel_index", &self.parallel_index)
            .finish()
    }
}

/// Uniform interface over concrete execution backends.
///
/// The returned value is raw: retry-signal classification happens in the
/// stage executor, not here. Long-running backends should poll `cancel`
/// and bail out with an `Aborted` error.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Runs one callable against one input.
    async fn invoke(
        &self,
        callable: CallableRef,
        input: Value,
        ctx: AmbientContext,
        relay: Option<ChunkRelay>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Value, PipelineError>;
}

/// Handler signature for [`FnBackend`].
pub type Handler = Arc<
    dyn Fn(&CallableRef, &Value, &AmbientContext, Option<&ChunkRelay>) -> Result<Value, PipelineError>
        + Send
        + Sync,
>;

/// In-process backend over registered closures, for tests and embedding.
#[derive(Default)]
pub struct FnBackend {
    handlers: HashMap<String, Handler>,
}

impl FnBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a callable name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&CallableRef, &Value, &AmbientContext, Option<&ChunkRelay>) -> Result<Value, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Registers a handler and returns self, for chaining.
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallableRef, &Value, &AmbientContext, Option<&ChunkRelay>) -> Result<Value, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, handler);
        self
    }
}

impl std::fmt::Debug for FnBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBackend")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ExecutorBackend for FnBackend {
    async fn invoke(
        &self,
        callable: CallableRef,
        input: Value,
        ctx: AmbientContext,
        relay: Option<ChunkRelay>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Value, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::aborted(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }
        let handler = self.handlers.get(&callable.name).ok_or_else(|| {
            PipelineError::execution(
                ctx.stage_index,
                format!("unknown callable '{}'", callable.name),
            )
        })?;
        handler(&callable, &input, &ctx, relay.as_ref())
    }
}
