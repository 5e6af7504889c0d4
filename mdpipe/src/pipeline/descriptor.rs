//! Pipeline and stage descriptors.
//!
//! A [`Pipeline`] is an immutable description of what to run: an ordered
//! list of [`StageDescriptor`]s plus the initial input and stream format.
//! Validation happens once, in [`PipelineBuilder::build`], so a pipeline
//! handed to the orchestrator is already known to be well formed.

use crate::effects::EffectDescriptor;
use crate::errors::PipelineError;
use crate::events::StreamFormat;
use crate::stage::CallableRef;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How a stage dispatches its callables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// One callable, invoked once per attempt.
    Sequential,
    /// Two or more callables, fanned out concurrently and joined.
    ParallelGroup,
}

/// Per-stage execution options.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Relay raw output chunks through the stream bus during execution.
    pub stream: bool,
    /// Stage-level stream format, overriding the pipeline-level one.
    pub format: Option<StreamFormat>,
    /// Wall-clock budget for a single attempt.
    pub timeout: Option<Duration>,
}

/// Guard names attached to a stage.
#[derive(Debug, Clone, Default)]
pub struct GuardSet {
    /// Checked against the stage input before each attempt.
    pub before: Option<String>,
    /// Checked against the stage output after a successful attempt.
    pub after: Option<String>,
}

impl GuardSet {
    /// Names of all attached guards, before first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.before.iter().chain(self.after.iter()).cloned().collect()
    }

    /// Returns true when no guards are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// One stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Position in the pipeline, starting at zero.
    pub index: usize,
    /// Sequential or parallel dispatch.
    pub kind: StageKind,
    /// Exactly one callable for sequential stages, one per branch for
    /// parallel groups.
    pub callables: Vec<CallableRef>,
    /// Streaming, format, and timeout options.
    pub options: StageOptions,
    /// Inline effects, run in declaration order after a successful attempt.
    pub effects: Vec<EffectDescriptor>,
    /// Guards checked around each attempt.
    pub guards: GuardSet,
}

impl StageDescriptor {
    /// A sequential stage around a single callable.
    #[must_use]
    pub fn sequential(index: usize, callable: CallableRef) -> Self {
        Self {
            index,
            kind: StageKind::Sequential,
            callables: vec![callable],
            options: StageOptions::default(),
            effects: Vec::new(),
            guards: GuardSet::default(),
        }
    }

    /// A parallel group fanning out over `callables`.
    #[must_use]
    pub fn parallel(index: usize, callables: Vec<CallableRef>) -> Self {
        Self {
            index,
            kind: StageKind::ParallelGroup,
            callables,
            options: StageOptions::default(),
            effects: Vec::new(),
            guards: GuardSet::default(),
        }
    }

    /// Enables chunk streaming for this stage.
    #[must_use]
    pub fn streamed(mut self) -> Self {
        self.options.stream = true;
        self
    }

    /// Caps a single attempt at `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Sets a stage-level stream format.
    #[must_use]
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.options.format = Some(format);
        self
    }

    /// Attaches inline effects.
    #[must_use]
    pub fn with_effects(mut self, effects: Vec<EffectDescriptor>) -> Self {
        self.effects = effects;
        self
    }

    /// Attaches guards.
    #[must_use]
    pub fn with_guards(mut self, guards: GuardSet) -> Self {
        self.guards = guards;
        self
    }

    /// Display label for events and logs.
    #[must_use]
    pub fn command_label(&self) -> String {
        match self.kind {
            StageKind::Sequential => self
                .callables
                .first()
                .map(|c| c.name.clone())
                .unwrap_or_default(),
            StageKind::ParallelGroup => {
                let names: Vec<&str> =
                    self.callables.iter().map(|c| c.name.as_str()).collect();
                format!("parallel:{}", names.join("|"))
            }
        }
    }

    fn validate(&self, position: usize) -> Result<(), PipelineError> {
        if self.index != position {
            return Err(PipelineError::configuration(format!(
                "stage index {} does not match its position {position}",
                self.index
            )));
        }
        match self.kind {
            StageKind::Sequential if self.callables.len() != 1 => {
                Err(PipelineError::configuration(format!(
                    "sequential stage {} must have exactly one callable, got {}",
                    self.index,
                    self.callables.len()
                )))
            }
            StageKind::ParallelGroup if self.callables.len() < 2 => {
                Err(PipelineError::configuration(format!(
                    "parallel stage {} must have at least two callables",
                    self.index
                )))
            }
            _ if self.options.stream && self.guards.after.is_some() => {
                Err(PipelineError::StreamingGuardConflict {
                    stage_index: self.index,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Re-acquires the pipeline's initial input, for retries that target
/// stage zero when the source can be refreshed.
pub type SourceFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, PipelineError>> + Send + Sync>;

/// A validated, runnable pipeline description.
#[derive(Clone)]
pub struct Pipeline {
    /// Stages in execution order.
    pub stages: Vec<StageDescriptor>,
    /// Input handed to stage zero on its first attempt.
    pub initial_input: Value,
    /// Pipeline-level stream format applied to every streamed stage that
    /// does not override it.
    pub format: Option<StreamFormat>,
    /// Whether a retry may target stage zero.
    pub source_retryable: bool,
    /// Re-acquires the initial input for retries that target stage zero.
    pub source_fn: Option<SourceFn>,
}

impl Pipeline {
    /// Starts building a pipeline with `initial_input`.
    #[must_use]
    pub fn builder(initial_input: Value) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            initial_input,
            format: None,
            source_retryable: false,
            source_fn: None,
        }
    }

    #[must_use]
    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("initial_input", &self.initial_input)
            .field("format", &self.format)
            .field("source_retryable", &self.source_retryable)
            .field("source_fn", &self.source_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Accumulates stages and validates the pipeline once at build time.
pub struct PipelineBuilder {
    stages: Vec<StageDescriptor>,
    initial_input: Value,
    format: Option<StreamFormat>,
    source_retryable: bool,
    source_fn: Option<SourceFn>,
}

impl PipelineBuilder {
    /// Appends a stage. Its index must equal its position.
    #[must_use]
    pub fn stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the pipeline-level stream format.
    #[must_use]
    pub fn format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Marks stage zero as a valid retry target.
    #[must_use]
    pub fn source_retryable(mut self) -> Self {
        self.source_retryable = true;
        self
    }

    /// Installs a source function; implies `source_retryable`.
    #[must_use]
    pub fn source_fn(mut self, f: SourceFn) -> Self {
        self.source_fn = Some(f);
        self.source_retryable = true;
        self
    }

    /// Validates the accumulated description.
    ///
    /// Rejects empty pipelines, out-of-position stage indices, callable
    /// counts that do not match the stage kind, an after-guard on a
    /// streamed stage, and unresolvable stream formats. Nothing executes
    /// on failure.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::configuration(
                "a pipeline needs at least one stage",
            ));
        }
        for (position, stage) in self.stages.iter().enumerate() {
            stage.validate(position)?;
            if let Some(format) = &stage.options.format {
                format.resolve()?;
            }
        }
        if let Some(format) = &self.format {
            format.resolve()?;
        }
        Ok(Pipeline {
            stages: self.stages,
            initial_input: self.initial_input,
            format: self.format,
            source_retryable: self.source_retryable,
            source_fn: self.source_fn,
        })
    }
}

/// What happens to the run when a parallel group has failed branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelFailureMode {
    /// Any failed branch fails the stage once all branches have settled.
    #[default]
    FailFast,
    /// The run proceeds with `null` at failed indices; branch errors are
    /// reported on the final result.
    Continue,
}

/// Per-run knobs, distinct from the pipeline description itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Detach all sinks up front and skip the streaming summary. Stage
    /// outputs are unaffected.
    pub suppress_streaming: bool,
    /// Run behavior when a parallel group has failed branches.
    pub parallel_failure: ParallelFailureMode,
    /// Ceiling on attempts per stage; `None` means unbounded.
    pub max_stage_attempts: Option<u32>,
}
