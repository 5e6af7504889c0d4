//! The per-run stream bus and its sink manager.
//!
//! One bus per pipeline run, exclusively owned by that run. Events fan out
//! synchronously to the attached sinks in attach order, so delivery order
//! is the emission order.

use super::event::StreamEvent;
use super::sink::{SinkKind, StreamSink};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of attaching a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The sink is now subscribed.
    Attached,
    /// A raw sink was refused because an adapter claims the chunk stream.
    Superseded,
}

/// Owns the sink list; only the manager may attach or detach sinks.
#[derive(Default)]
pub struct SinkManager {
    sinks: RwLock<Vec<Arc<dyn StreamSink>>>,
    detached: AtomicBool,
}

impl SinkManager {
    fn has_kind(&self, kind: SinkKind) -> bool {
        self.sinks.read().iter().any(|s| s.kind() == kind)
    }

    /// Attaches a sink, enforcing adapter/raw exclusivity.
    ///
    /// An adapter supersedes raw passthrough: attaching an adapter removes
    /// any raw sink, and a raw sink is refused while an adapter is present.
    pub fn attach(&self, sink: Arc<dyn StreamSink>) -> AttachOutcome {
        match sink.kind() {
            SinkKind::Raw if self.has_kind(SinkKind::Adapter) => {
                tracing::warn!(sink = sink.name(), "raw sink superseded by format adapter");
                return AttachOutcome::Superseded;
            }
            SinkKind::Adapter => {
                let mut sinks = self.sinks.write();
                sinks.retain(|s| {
                    let keep = s.kind() != SinkKind::Raw;
                    if !keep {
                        tracing::warn!(sink = s.name(), "raw sink superseded by format adapter");
                        s.on_detach();
                    }
                    keep
                });
                sinks.push(sink);
                return AttachOutcome::Attached;
            }
            _ => {}
        }
        self.sinks.write().push(sink);
        AttachOutcome::Attached
    }

    /// Delivers one event to every sink, in attach order.
    pub fn broadcast(&self, event: &StreamEvent) {
        for sink in self.sinks.read().iter() {
            sink.on_event(event);
        }
    }

    /// Detaches every sink. Effective exactly once; later calls are no-ops.
    pub fn detach_all(&self) -> bool {
        if self.detached.swap(true, Ordering::SeqCst) {
            return false;
        }
        let sinks: Vec<_> = std::mem::take(&mut *self.sinks.write());
        for sink in sinks {
            sink.on_detach();
        }
        true
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl std::fmt::Debug for SinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkManager")
            .field("sink_count", &self.sink_count())
            .field("detached", &self.detached.load(Ordering::SeqCst))
            .finish()
    }
}

/// The typed event bus for one pipeline run.
///
/// Never a process-wide singleton: the orchestrator creates the bus with
/// the run and tears it down at the terminal transition, so concurrent
/// runs cannot interfere.
pub struct StreamBus {
    pipeline_id: Uuid,
    manager: SinkManager,
    suppressed: AtomicBool,
    recorded: RwLock<Vec<StreamEvent>>,
}

impl StreamBus {
    /// Creates a bus for one run.
    #[must_use]
    pub fn new(pipeline_id: Uuid) -> Self {
        Self {
            pipeline_id,
            manager: SinkManager::default(),
            suppressed: AtomicBool::new(false),
            recorded: RwLock::new(Vec::new()),
        }
    }

    /// The owning run's correlation id.
    #[must_use]
    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    /// The sink manager for this bus.
    #[must_use]
    pub fn sinks(&self) -> &SinkManager {
        &self.manager
    }

    /// Detaches all sinks and drops every later event.
    ///
    /// Suppression is observationally transparent to the buffered result:
    /// the run computes identical output and exports, it just emits zero
    /// events.
    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
        self.manager.detach_all();
    }

    /// Returns true if the bus is suppressed.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Publishes one event: records it and fans it out to the sinks.
    pub fn emit(&self, event: StreamEvent) {
        if self.is_suppressed() {
            return;
        }
        self.recorded.write().push(event.clone());
        self.manager.broadcast(&event);
    }

    /// All events emitted so far, in emission order.
    #[must_use]
    pub fn recorded(&self) -> Vec<StreamEvent> {
        self.recorded.read().clone()
    }
}

impl std::fmt::Debug for StreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBus")
            .field("pipeline_id", &self.pipeline_id)
            .field("suppressed", &self.is_suppressed())
            .field("sinks", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::adapter::{FormatAdapterSink, PlainTextAdapter};
    use crate::events::sink::{CollectingSink, TerminalSink};

    fn bus() -> StreamBus {
        StreamBus::new(Uuid::new_v4())
    }

    #[test]
    fn events_fan_out_in_attach_order() {
        let bus = bus();
        let first = Arc::new(CollectingSink::new());
        let second = Arc::new(CollectingSink::new());
        bus.sinks().attach(first.clone());
        bus.sinks().attach(second.clone());

        bus.emit(StreamEvent::chunk(bus.pipeline_id(), 0, None, "x"));

        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
        assert_eq!(bus.recorded().len(), 1);
    }

    #[test]
    fn suppression_drops_events_and_sinks() {
        let bus = bus();
        let sink = Arc::new(CollectingSink::new());
        bus.sinks().attach(sink.clone());

        bus.suppress();
        bus.emit(StreamEvent::chunk(bus.pipeline_id(), 0, None, "dropped"));

        assert!(sink.events().is_empty());
        assert!(bus.recorded().is_empty());
        assert_eq!(sink.detach_count(), 1);
    }

    #[test]
    fn detach_all_is_exactly_once() {
        let bus = bus();
        let sink = Arc::new(CollectingSink::new());
        bus.sinks().attach(sink.clone());

        assert!(bus.sinks().detach_all());
        assert!(!bus.sinks().detach_all());
        assert_eq!(sink.detach_count(), 1);
        assert_eq!(bus.sinks().sink_count(), 0);
    }

    #[test]
    fn adapter_supersedes_raw_passthrough() {
        let bus = bus();
        let raw = Arc::new(TerminalSink::with_writer(Box::new(std::io::sink())));
        assert_eq!(bus.sinks().attach(raw), AttachOutcome::Attached);

        let adapter = Arc::new(FormatAdapterSink::new(Arc::new(PlainTextAdapter)));
        assert_eq!(bus.sinks().attach(adapter), AttachOutcome::Attached);
        // Raw sink was removed in favor of the adapter.
        assert_eq!(bus.sinks().sink_count(), 1);

        let raw_again = Arc::new(TerminalSink::with_writer(Box::new(std::io::sink())));
        assert_eq!(bus.sinks().attach(raw_again), AttachOutcome::Superseded);
    }

    #[test]
    fn observers_coexist_with_adapter() {
        let bus = bus();
        bus.sinks()
            .attach(Arc::new(FormatAdapterSink::new(Arc::new(PlainTextAdapter))));
        bus.sinks().attach(Arc::new(CollectingSink::new()));
        assert_eq!(bus.sinks().sink_count(), 2);
    }
}
