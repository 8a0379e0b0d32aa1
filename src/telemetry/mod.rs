//! Telemetry: logging and metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use metrics::{Counter, MetricsRegistry};
