//! Streaming event bus and sinks.
//!
//! Each pipeline run owns one [`StreamBus`]; sinks subscribe through its
//! [`SinkManager`] before the run starts and are detached exactly once at
//! the terminal transition.

mod adapter;
mod bus;
mod event;
mod sink;

pub use adapter::{
    AdapterConfig, FormatAdapter, FormatAdapterSink, JsonLinesAdapter, ParsedEvent,
    ParsedEventConsumer, PlainTextAdapter, StreamFormat,
};
pub use bus::{AttachOutcome, SinkManager, StreamBus};
pub use event::{EventSource, StreamEvent, StreamEventKind};
pub use sink::{CollectingSink, Progress, ProgressOnlySink, SinkKind, StreamSink, TerminalSink};
