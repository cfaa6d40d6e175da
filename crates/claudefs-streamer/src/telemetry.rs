//! Log subscriber setup for processes embedding the streamer.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TracingFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(format: TracingFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        TracingFormat::Text => registry.with(fmt::layer()).try_init(),
        TracingFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(TracingFormat::Text);
        assert!(!init_tracing(TracingFormat::Json));
        tracing::info!("telemetry test event");
    }

    #[test]
    fn test_format_serde() {
        let json = serde_json::to_string(&TracingFormat::Json).unwrap();
        assert_eq!(json, "\"Json\"");
        assert_eq!(TracingFormat::default(), TracingFormat::Text);
    }
}
