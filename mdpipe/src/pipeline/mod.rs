//! Pipeline descriptors, the orchestrator, and run results.

mod descriptor;
mod orchestrator;
mod result;

pub use descriptor::{
    GuardSet, ParallelFailureMode, Pipeline, PipelineBuilder, RunOptions, SourceFn,
    StageDescriptor, StageKind, StageOptions,
};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use result::{StreamingSummary, StructuredResult};
