//! ## credence-telemetry::logging
//! **Structured logging with tracing**
//!
//! Balance lifecycle events (connect, disconnect, priority changes) are
//! emitted inside an `info_span!` carrying the event kind, with the event
//! attributes attached as OpenTelemetry key-values.

use opentelemetry::KeyValue;
use tracing::info_span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
    ///
    /// Calling it twice is harmless; the second installation is ignored.
    pub fn init(default_level: &str) {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_thread_names(true)
            .with_span_events(FmtSpan::NONE)
            .try_init();
    }

    #[inline]
    pub fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!("balance_event", event_type = event_type);
        let _entered = span.enter();
        tracing::info!(metadata = ?metadata, "Balance event occurred");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logging() {
        EventLogger::log_event("priority_lost", vec![KeyValue::new("node", "00ff")]);
        assert!(logs_contain("Balance event occurred"));
        assert!(logs_contain("priority_lost"));
    }
}
