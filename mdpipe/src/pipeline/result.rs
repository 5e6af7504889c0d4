//! Structured run results.

use crate::effects::StructuredEffect;
use crate::errors::ParallelBranchError;
use crate::events::StreamEvent;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// What was streamed during the run, absent when streaming was suppressed.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StreamingSummary {
    /// Adapter-accumulated text, or raw chunk text concatenated in emit
    /// order when no adapter was attached.
    pub accumulated: String,
    /// Every event the bus carried, in emit order.
    pub events: Vec<StreamEvent>,
}

/// Final output of a successful run.
///
/// The `output` field is identical whether or not streaming was enabled
/// for the run; streaming only adds the `streaming` summary.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredResult {
    /// Output of the last stage.
    pub output: Value,
    /// Inline-effect records across the whole run, in execution order.
    pub effects: Vec<StructuredEffect>,
    /// Values captured by export effects, keyed by export name.
    pub exports: HashMap<String, Value>,
    /// Streaming summary, absent when streaming was suppressed.
    pub streaming: Option<StreamingSummary>,
    /// Branch failures tolerated under the continue failure mode.
    pub branch_errors: Vec<ParallelBranchError>,
}
