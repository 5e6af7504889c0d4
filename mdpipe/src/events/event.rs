//! Typed stream events published on the per-run bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which component emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// The stage orchestrator.
    Orchestrator,
    /// The stage executor (sequential stage output).
    Executor,
    /// A parallel branch task.
    Branch,
}

/// Per-kind payload of a [`StreamEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEventKind {
    /// The run started; no stage has executed yet.
    PipelineStart {
        /// Number of stages in the pipeline.
        total_stages: usize,
    },
    /// The run reached `Succeeded`.
    PipelineComplete,
    /// The run reached `Aborted`.
    PipelineAbort {
        /// The abort reason.
        reason: String,
    },
    /// A stage attempt began.
    StageStart {
        /// 1-based attempt number.
        attempt: u32,
        /// Name of the invoked callable (or group label).
        command: String,
    },
    /// A stage attempt settled successfully.
    StageSuccess {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A stage attempt failed unrecoverably.
    StageFailure {
        /// 1-based attempt number.
        attempt: u32,
        /// The failure message.
        message: String,
    },
    /// A fragment of raw output from an executing stage.
    Chunk {
        /// The raw chunk text.
        text: String,
    },
}

/// One event on the stream bus.
///
/// Events are published in emission order; within one branch chunk order is
/// preserved, across branches chunks interleave by arrival time and are
/// disambiguated solely via `parallel_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Correlation id of the owning run.
    pub pipeline_id: Uuid,
    /// The stage this event belongs to, if any.
    pub stage_index: Option<usize>,
    /// The branch this event belongs to, for parallel groups.
    pub parallel_index: Option<usize>,
    /// The emitting component.
    pub source: EventSource,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Per-kind payload.
    pub kind: StreamEventKind,
}

impl StreamEvent {
    fn new(
        pipeline_id: Uuid,
        stage_index: Option<usize>,
        parallel_index: Option<usize>,
        source: EventSource,
        kind: StreamEventKind,
    ) -> Self {
        Self {
            pipeline_id,
            stage_index,
            parallel_index,
            source,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Creates a `PipelineStart` event.
    #[must_use]
    pub fn pipeline_start(pipeline_id: Uuid, total_stages: usize) -> Self {
        Self::new(
            pipeline_id,
            None,
            None,
            EventSource::Orchestrator,
            StreamEventKind::PipelineStart { total_stages },
        )
    }

    /// Creates a `PipelineComplete` event.
    #[must_use]
    pub fn pipeline_complete(pipeline_id: Uuid) -> Self {
        Self::new(
            pipeline_id,
            None,
            None,
            EventSource::Orchestrator,
            StreamEventKind::PipelineComplete,
        )
    }

    /// Creates a `PipelineAbort` event.
    #[must_use]
    pub fn pipeline_abort(pipeline_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(
            pipeline_id,
            None,
            None,
            EventSource::Orchestrator,
            StreamEventKind::PipelineAbort {
                reason: reason.into(),
            },
        )
    }

    /// Creates a `StageStart` event.
    #[must_use]
    pub fn stage_start(
        pipeline_id: Uuid,
        stage_index: usize,
        attempt: u32,
        command: impl Into<String>,
    ) -> Self {
        Self::new(
            pipeline_id,
            Some(stage_index),
            None,
            EventSource::Orchestrator,
            StreamEventKind::StageStart {
                attempt,
                command: command.into(),
            },
        )
    }

    /// Creates a `StageSuccess` event.
    #[must_use]
    pub fn stage_success(pipeline_id: Uuid, stage_index: usize, attempt: u32) -> Self {
        Self::new(
            pipeline_id,
            Some(stage_index),
            None,
            EventSource::Orchestrator,
            StreamEventKind::StageSuccess { attempt },
        )
    }

    /// Creates a `StageFailure` event.
    #[must_use]
    pub fn stage_failure(
        pipeline_id: Uuid,
        stage_index: usize,
        attempt: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            pipeline_id,
            Some(stage_index),
            None,
            EventSource::Orchestrator,
            StreamEventKind::StageFailure {
                attempt,
                message: message.into(),
            },
        )
    }

    /// Creates a `Chunk` event.
    #[must_use]
    pub fn chunk(
        pipeline_id: Uuid,
        stage_index: usize,
        parallel_index: Option<usize>,
        text: impl Into<String>,
    ) -> Self {
        let source = if parallel_index.is_some() {
            EventSource::Branch
        } else {
            EventSource::Executor
        };
        Self::new(
            pipeline_id,
            Some(stage_index),
            parallel_index,
            source,
            StreamEventKind::Chunk { text: text.into() },
        )
    }

    /// Returns the chunk text when this is a `Chunk` event.
    #[must_use]
    pub fn chunk_text(&self) -> Option<&str> {
        match &self.kind {
            StreamEventKind::Chunk { text } => Some(text),
            _ => None,
        }
    }

    /// Returns true for `Chunk` events.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        matches!(self.kind, StreamEventKind::Chunk { .. })
    }
}
