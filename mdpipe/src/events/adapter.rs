//! Format adapters: raw chunk text to typed parsed events.
//!
//! The caller's `streamFormat` input (a plain name or a structured config)
//! is resolved into one concrete adapter at configuration time; invalid
//! shapes are rejected before any stage executes.

use super::event::{StreamEvent, StreamEventKind};
use super::sink::{SinkKind, StreamSink};
use crate::errors::PipelineError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A typed event derived from raw chunk text by a format adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedEvent {
    /// Plain output text.
    Text {
        /// The text fragment.
        text: String,
        /// The raw chunk the fragment came from.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
    /// Model/interpreter reasoning output.
    Thinking {
        /// The reasoning fragment.
        text: String,
        /// The raw chunk.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
    /// A tool invocation surfaced mid-stream.
    ToolUse {
        /// Tool name.
        name: String,
        /// Tool input payload.
        input: Value,
        /// The raw chunk.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
    /// The result of a surfaced tool invocation.
    ToolResult {
        /// Tool name, when reported.
        name: Option<String>,
        /// Tool output payload.
        output: Value,
        /// The raw chunk.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
    /// An error reported inside the stream.
    Error {
        /// The error message.
        message: String,
        /// The raw chunk.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
    /// Structured metadata that is none of the above.
    Metadata {
        /// The metadata payload.
        data: Value,
        /// The raw chunk.
        raw: String,
        /// Parse time.
        timestamp: DateTime<Utc>,
    },
}

impl ParsedEvent {
    /// Returns the displayable text fragment, if this event carries one.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Structured adapter configuration, the alternative to a plain name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Adapter name ("text" or "json").
    pub adapter: String,
    /// Adapter-specific options.
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

/// The caller-facing `streamFormat` input: a named adapter or an inline
/// adapter-config object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFormat {
    /// A built-in adapter referenced by name.
    Named(String),
    /// An inline adapter configuration.
    Config(AdapterConfig),
}

impl StreamFormat {
    /// Resolves the format into one concrete adapter.
    ///
    /// Called once at pipeline construction; unknown names and malformed
    /// configs are `Configuration` errors.
    pub fn resolve(&self) -> Result<Arc<dyn FormatAdapter>, PipelineError> {
        let name = match self {
            Self::Named(name) => name.as_str(),
            Self::Config(config) => config.adapter.as_str(),
        };
        match name {
            "text" => Ok(Arc::new(PlainTextAdapter)),
            "json" => Ok(Arc::new(JsonLinesAdapter)),
            other => Err(PipelineError::configuration(format!(
                "unknown stream format adapter '{other}'"
            ))),
        }
    }
}

/// Parses raw chunk text into [`ParsedEvent`]s.
pub trait FormatAdapter: Send + Sync {
    /// Adapter name.
    fn name(&self) -> &str;

    /// Parses one raw chunk into zero or more typed events.
    fn parse_chunk(&self, raw: &str) -> Vec<ParsedEvent>;
}

/// Treats every chunk as plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextAdapter;

impl FormatAdapter for PlainTextAdapter {
    fn name(&self) -> &str {
        "text"
    }

    fn parse_chunk(&self, raw: &str) -> Vec<ParsedEvent> {
        vec![ParsedEvent::Text {
            text: raw.to_string(),
            raw: raw.to_string(),
            timestamp: Utc::now(),
        }]
    }
}

/// Parses newline-delimited JSON objects with a `type` tag.
///
/// Recognized tags map onto the [`ParsedEvent`] kinds; untagged objects
/// become `Metadata` and non-JSON lines fall back to `Text`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesAdapter;

impl JsonLinesAdapter {
    fn parse_line(raw: &str) -> ParsedEvent {
        let now = Utc::now();
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return ParsedEvent::Text {
                text: raw.to_string(),
                raw: raw.to_string(),
                timestamp: now,
            };
        };

        let tag = value.get("type").and_then(Value::as_str);
        match tag {
            Some("text") => ParsedEvent::Text {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                raw: raw.to_string(),
                timestamp: now,
            },
            Some("thinking") => ParsedEvent::Thinking {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                raw: raw.to_string(),
                timestamp: now,
            },
            Some("tool_use") => ParsedEvent::ToolUse {
                name: value
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
                raw: raw.to_string(),
                timestamp: now,
            },
            Some("tool_result") => ParsedEvent::ToolResult {
                name: value
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from),
                output: value.get("output").cloned().unwrap_or(Value::Null),
                raw: raw.to_string(),
                timestamp: now,
            },
            Some("error") => ParsedEvent::Error {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                raw: raw.to_string(),
                timestamp: now,
            },
            _ => ParsedEvent::Metadata {
                data: value,
                raw: raw.to_string(),
                timestamp: now,
            },
        }
    }
}

impl FormatAdapter for JsonLinesAdapter {
    fn name(&self) -> &str {
        "json"
    }

    fn parse_chunk(&self, raw: &str) -> Vec<ParsedEvent> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }
}

/// Receives parsed events from a [`FormatAdapterSink`] in real time.
pub trait ParsedEventConsumer: Send + Sync {
    /// Receives one parsed event.
    fn on_parsed(&self, event: &ParsedEvent);
}

/// Bus sink that routes chunk events through a format adapter.
///
/// Chunks are parsed by the default adapter unless their stage carries a
/// per-stage override. Forwards typed events to an optional external
/// consumer and accumulates text fragments for the final result's
/// `streaming.accumulated`.
pub struct FormatAdapterSink {
    adapter: Arc<dyn FormatAdapter>,
    stage_overrides: HashMap<usize, Arc<dyn FormatAdapter>>,
    consumer: Option<Arc<dyn ParsedEventConsumer>>,
    accumulated: Mutex<String>,
    parsed: Mutex<Vec<ParsedEvent>>,
}

impl FormatAdapterSink {
    /// Creates a sink over a resolved default adapter.
    #[must_use]
    pub fn new(adapter: Arc<dyn FormatAdapter>) -> Self {
        Self {
            adapter,
            stage_overrides: HashMap::new(),
            consumer: None,
            accumulated: Mutex::new(String::new()),
            parsed: Mutex::new(Vec::new()),
        }
    }

    /// Routes chunks from `stage_index` through `adapter` instead of the
    /// default.
    #[must_use]
    pub fn with_stage_override(
        mut self,
        stage_index: usize,
        adapter: Arc<dyn FormatAdapter>,
    ) -> Self {
        self.stage_overrides.insert(stage_index, adapter);
        self
    }

    /// Attaches a real-time consumer of parsed events.
    #[must_use]
    pub fn with_consumer(mut self, consumer: Arc<dyn ParsedEventConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    fn adapter_for(&self, stage_index: Option<usize>) -> &Arc<dyn FormatAdapter> {
        stage_index
            .and_then(|index| self.stage_overrides.get(&index))
            .unwrap_or(&self.adapter)
    }

    /// Returns the text accumulated so far.
    #[must_use]
    pub fn accumulated(&self) -> String {
        self.accumulated.lock().clone()
    }

    /// Returns all parsed events so far.
    #[must_use]
    pub fn parsed_events(&self) -> Vec<ParsedEvent> {
        self.parsed.lock().clone()
    }
}

impl StreamSink for FormatAdapterSink {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Adapter
    }

    fn on_event(&self, event: &StreamEvent) {
        let StreamEventKind::Chunk { text } = &event.kind else {
            return;
        };
        for parsed in self.adapter_for(event.stage_index).parse_chunk(text) {
            if let Some(fragment) = parsed.text() {
                self.accumulated.lock().push_str(fragment);
            }
            if let Some(consumer) = &self.consumer {
                consumer.on_parsed(&parsed);
            }
            self.parsed.lock().push(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn named_format_resolves() {
        assert_eq!(
            StreamFormat::Named("json".to_string()).resolve().unwrap().name(),
            "json"
        );
        assert_eq!(
            StreamFormat::Named("text".to_string()).resolve().unwrap().name(),
            "text"
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = StreamFormat::Named("yaml".to_string())
            .resolve()
            .map(|adapter| adapter.name().to_string())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn config_format_resolves_by_adapter_field() {
        let format = StreamFormat::Config(AdapterConfig {
            adapter: "json".to_string(),
            options: HashMap::new(),
        });
        assert_eq!(format.resolve().unwrap().name(), "json");
    }

    #[test]
    fn format_deserializes_from_name_or_object() {
        let named: StreamFormat = serde_json::from_value(json!("text")).unwrap();
        assert_eq!(named, StreamFormat::Named("text".to_string()));

        let config: StreamFormat =
            serde_json::from_value(json!({"adapter": "json"})).unwrap();
        assert!(matches!(config, StreamFormat::Config(_)));
    }

    #[test]
    fn json_lines_adapter_maps_type_tags() {
        let adapter = JsonLinesAdapter;
        let events = adapter.parse_chunk(
            "{\"type\":\"text\",\"text\":\"hi\"}\n\
             {\"type\":\"thinking\",\"text\":\"hmm\"}\n\
             {\"type\":\"tool_use\",\"name\":\"grep\",\"input\":{\"q\":\"x\"}}\n\
             {\"type\":\"error\",\"message\":\"bad\"}\n\
             {\"tokens\": 12}\n\
             not json",
        );

        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], ParsedEvent::Text { .. }));
        assert!(matches!(events[1], ParsedEvent::Thinking { .. }));
        assert!(matches!(events[2], ParsedEvent::ToolUse { ref name, .. } if name == "grep"));
        assert!(matches!(events[3], ParsedEvent::Error { .. }));
        assert!(matches!(events[4], ParsedEvent::Metadata { .. }));
        assert!(matches!(events[5], ParsedEvent::Text { .. }));
    }

    #[test]
    fn adapter_sink_accumulates_text_fragments() {
        let sink = FormatAdapterSink::new(Arc::new(JsonLinesAdapter));
        let id = Uuid::new_v4();

        sink.on_event(&StreamEvent::chunk(
            id,
            0,
            None,
            "{\"type\":\"text\",\"text\":\"hello \"}",
        ));
        sink.on_event(&StreamEvent::chunk(
            id,
            0,
            None,
            "{\"type\":\"thinking\",\"text\":\"ignored\"}",
        ));
        sink.on_event(&StreamEvent::chunk(
            id,
            0,
            None,
            "{\"type\":\"text\",\"text\":\"world\"}",
        ));
        // Non-chunk events are ignored.
        sink.on_event(&StreamEvent::pipeline_complete(id));

        assert_eq!(sink.accumulated(), "hello world");
        assert_eq!(sink.parsed_events().len(), 3);
    }

    #[test]
    fn adapter_sink_forwards_to_consumer() {
        #[derive(Default)]
        struct Counter(std::sync::atomic::AtomicUsize);
        impl ParsedEventConsumer for Counter {
            fn on_parsed(&self, _event: &ParsedEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter::default());
        let sink = FormatAdapterSink::new(Arc::new(PlainTextAdapter))
            .with_consumer(counter.clone());

        sink.on_event(&StreamEvent::chunk(Uuid::new_v4(), 0, None, "a"));
        sink.on_event(&StreamEvent::chunk(Uuid::new_v4(), 0, None, "b"));

        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn stage_override_routes_chunks_by_stage() {
        let sink = FormatAdapterSink::new(Arc::new(PlainTextAdapter))
            .with_stage_override(1, Arc::new(JsonLinesAdapter));
        let id = Uuid::new_v4();

        sink.on_event(&StreamEvent::chunk(id, 0, None, "plain "));
        sink.on_event(&StreamEvent::chunk(
            id,
            1,
            None,
            "{\"type\":\"text\",\"text\":\"typed\"}",
        ));

        assert_eq!(sink.accumulated(), "plain typed");
    }
}
