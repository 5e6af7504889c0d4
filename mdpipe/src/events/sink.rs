//! Stream sink trait and built-in sinks.

use super::event::{StreamEvent, StreamEventKind};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// The role a sink plays on the bus.
///
/// At most one `Adapter` or `Raw` sink may be attached at a time; an
/// adapter supersedes raw passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Parses chunks through a format adapter.
    Adapter,
    /// Writes raw chunk bytes straight to an output channel.
    Raw,
    /// Observes events without claiming the chunk stream.
    Observer,
}

/// A subscriber to the stream bus.
///
/// Sinks receive events synchronously, in emission order, and are detached
/// deterministically exactly once at the run's terminal transition.
pub trait StreamSink: Send + Sync {
    /// Sink name, for diagnostics.
    fn name(&self) -> &str;

    /// The sink's role on the bus.
    fn kind(&self) -> SinkKind {
        SinkKind::Observer
    }

    /// Receives one event. Must not block or panic.
    fn on_event(&self, event: &StreamEvent);

    /// Called exactly once when the sink is detached.
    fn on_detach(&self) {}
}

/// Writes raw chunk text straight to an output channel, for human-facing
/// progress. Mutually exclusive with a format adapter.
pub struct TerminalSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl TerminalSink {
    /// Creates a sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Creates a sink writing to an arbitrary channel.
    #[must_use]
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl StreamSink for TerminalSink {
    fn name(&self) -> &str {
        "terminal"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Raw
    }

    fn on_event(&self, event: &StreamEvent) {
        if let StreamEventKind::Chunk { text } = &event.kind {
            let mut writer = self.writer.lock();
            // Write errors are logged, never surfaced to the run.
            if let Err(err) = writer.write_all(text.as_bytes()).and_then(|()| writer.flush()) {
                tracing::warn!(error = %err, "terminal sink write failed");
            }
        }
    }
}

/// Snapshot of the coarse progress counters a [`ProgressOnlySink`] derives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Chunk events observed.
    pub chunks: u64,
    /// Stage attempts started.
    pub stages_started: u64,
    /// Stage attempts that succeeded.
    pub stages_succeeded: u64,
    /// Stage attempts that failed.
    pub stages_failed: u64,
}

/// Derives coarse progress signals without parsing chunk content.
///
/// May run alongside either an adapter or a raw sink.
#[derive(Debug, Default)]
pub struct ProgressOnlySink {
    chunks: AtomicU64,
    stages_started: AtomicU64,
    stages_succeeded: AtomicU64,
    stages_failed: AtomicU64,
}

impl ProgressOnlySink {
    /// Creates a new progress sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counters.
    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress {
            chunks: self.chunks.load(Ordering::SeqCst),
            stages_started: self.stages_started.load(Ordering::SeqCst),
            stages_succeeded: self.stages_succeeded.load(Ordering::SeqCst),
            stages_failed: self.stages_failed.load(Ordering::SeqCst),
        }
    }
}

impl StreamSink for ProgressOnlySink {
    fn name(&self) -> &str {
        "progress"
    }

    fn on_event(&self, event: &StreamEvent) {
        match event.kind {
            StreamEventKind::Chunk { .. } => {
                self.chunks.fetch_add(1, Ordering::SeqCst);
            }
            StreamEventKind::StageStart { .. } => {
                self.stages_started.fetch_add(1, Ordering::SeqCst);
            }
            StreamEventKind::StageSuccess { .. } => {
                self.stages_succeeded.fetch_add(1, Ordering::SeqCst);
            }
            StreamEventKind::StageFailure { .. } => {
                self.stages_failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
    detached: AtomicU64,
}

impl CollectingSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    /// Returns the collected chunk texts, in arrival order.
    #[must_use]
    pub fn chunk_texts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.chunk_text().map(String::from))
            .collect()
    }

    /// How many times the sink has been detached.
    #[must_use]
    pub fn detach_count(&self) -> u64 {
        self.detached.load(Ordering::SeqCst)
    }
}

impl StreamSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn on_event(&self, event: &StreamEvent) {
        self.events.lock().push(event.clone());
    }

    fn on_detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn terminal_sink_writes_chunks_only() {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = TerminalSink::with_writer(Box::new(Shared(buffer.clone())));
        let id = Uuid::new_v4();
        sink.on_event(&StreamEvent::chunk(id, 0, None, "hello "));
        sink.on_event(&StreamEvent::stage_success(id, 0, 1));
        sink.on_event(&StreamEvent::chunk(id, 0, None, "world"));

        assert_eq!(String::from_utf8(buffer.lock().clone()).unwrap(), "hello world");
    }

    #[test]
    fn progress_sink_counts() {
        let sink = ProgressOnlySink::new();
        let id = Uuid::new_v4();

        sink.on_event(&StreamEvent::stage_start(id, 0, 1, "cmd"));
        sink.on_event(&StreamEvent::chunk(id, 0, None, "x"));
        sink.on_event(&StreamEvent::chunk(id, 0, None, "y"));
        sink.on_event(&StreamEvent::stage_success(id, 0, 1));

        let progress = sink.progress();
        assert_eq!(progress.chunks, 2);
        assert_eq!(progress.stages_started, 1);
        assert_eq!(progress.stages_succeeded, 1);
        assert_eq!(progress.stages_failed, 0);
    }

    #[test]
    fn collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        let id = Uuid::new_v4();
        sink.on_event(&StreamEvent::chunk(id, 0, None, "a"));
        sink.on_event(&StreamEvent::chunk(id, 0, Some(1), "b"));

        assert_eq!(sink.chunk_texts(), vec!["a".to_string(), "b".to_string()]);
    }
}
