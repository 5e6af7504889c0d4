//! Tracing bootstrap for embedders and binaries.
//!
//! The engine itself only emits through the `tracing` facade; nothing here
//! is required for a run. Call [`init_tracing`] once from a host binary
//! that wants the engine's spans and events on stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output encoding for the bootstrap subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Installs a global subscriber filtered by `RUST_LOG`.
///
/// Returns false when a global subscriber is already installed, which is
/// common in tests and embedding hosts; the engine keeps working either
/// way.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mdpipe=info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.is_ok()
}
