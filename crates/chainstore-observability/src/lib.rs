//! chainstore-observability — logging bootstrap and metrics handles.
//!
//! Exporter wiring (OTLP, Prometheus, …) is the embedding application's
//! concern; this crate only defines the instruments the core records into.

pub mod metrics;
pub mod tracing_setup;

pub use metrics::ChainStoreMetrics;
pub use tracing_setup::{init_tracing, LogConfig};
