//! # Credence Telemetry
//!
//! Logging initialisation, structured balance event logging and prometheus
//! metrics for the balance tracker.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
