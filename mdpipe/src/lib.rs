//! # mdpipe
//!
//! The pipeline execution engine for a markdown-flavored scripting
//! runtime.
//!
//! A pipeline is an ordered chain of stages in which each stage's output
//! becomes the next stage's input. On top of that chain mdpipe layers:
//!
//! - **Stage-directed retries**: a stage can signal "run me (or an
//!   earlier stage) again", carrying a hint that the targeted stage sees
//!   on exactly its next attempt
//! - **Parallel groups**: a stage can fan out into concurrent branches
//!   that are all joined before the pipeline moves on
//! - **Streaming events**: a per-run bus carries lifecycle events and raw
//!   output chunks to pluggable sinks, with optional format adapters that
//!   parse chunks into structured events
//! - **Inline effects**: per-stage log/show/export actions that replay
//!   whenever their stage is re-run
//! - **Ambient context**: a read-only snapshot of the run handed to every
//!   attempt, its guards, and its effects
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mdpipe::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let backend = FnBackend::new()
//!     .with("summarize", |_call, input, _ctx, _relay| Ok(input.clone()));
//!
//! let pipeline = Pipeline::builder(json!("raw notes"))
//!     .stage(StageDescriptor::sequential(0, CallableRef::new("summarize")))
//!     .build()?;
//!
//! let result = Orchestrator::new(pipeline, Arc::new(backend)).run().await?;
//! println!("{}", result.output);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancel;
pub mod context;
pub mod effects;
pub mod errors;
pub mod events;
pub mod guards;
pub mod observability;
pub mod pipeline;
pub mod stage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::context::{
        AmbientContext, AttemptOutcome, AttemptRecord, ContextProvider,
    };
    pub use crate::effects::{EffectDescriptor, EffectKind, StructuredEffect};
    pub use crate::errors::{ParallelBranchError, PipelineError, RunFailure};
    pub use crate::events::{
        AdapterConfig, CollectingSink, FormatAdapter, FormatAdapterSink, ParsedEvent,
        ParsedEventConsumer, ProgressOnlySink, SinkKind, StreamBus, StreamEvent,
        StreamEventKind, StreamFormat, StreamSink, TerminalSink,
    };
    pub use crate::guards::{GuardDecision, GuardEngine, NoopGuardEngine};
    pub use crate::pipeline::{
        GuardSet, Orchestrator, OrchestratorState, ParallelFailureMode, Pipeline,
        PipelineBuilder, RunOptions, StageDescriptor, StageKind, StageOptions,
        StreamingSummary, StructuredResult,
    };
    pub use crate::stage::{
        CallableRef, ChunkRelay, ExecutorBackend, FnBackend, StageExecutor,
    };
}
