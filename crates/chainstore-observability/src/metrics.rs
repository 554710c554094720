//! chainstore metrics definitions.
//!
//! All metrics use OpenTelemetry conventions and can be exported via OTLP
//! to Prometheus, Grafana, Datadog, etc.

use std::time::Duration;

use opentelemetry::{
    metrics::{Histogram, Meter},
    KeyValue,
};

/// Central metrics handle for chainstore.
///
/// Cheap to clone; components accept an `Option<ChainStoreMetrics>` and
/// record nothing when none is supplied.
#[derive(Clone)]
pub struct ChainStoreMetrics {
    pub rpc_request_lag_ms: Histogram<f64>,
    pub rpc_request_duration_ms: Histogram<f64>,
    pub store_method_duration_ms: Histogram<f64>,
}

impl ChainStoreMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            rpc_request_lag_ms: meter
                .f64_histogram("chainstore.rpc_request_lag_ms")
                .with_description("Time an RPC request waited in the queue before dispatch")
                .build(),
            rpc_request_duration_ms: meter
                .f64_histogram("chainstore.rpc_request_duration_ms")
                .with_description("Time from RPC dispatch until the response settled")
                .build(),
            store_method_duration_ms: meter
                .f64_histogram("chainstore.store_method_duration_ms")
                .with_description("Duration of an entity-store operation")
                .build(),
        }
    }

    pub fn record_rpc_lag(&self, method: &str, network: &str, lag: Duration) {
        self.rpc_request_lag_ms.record(
            lag.as_secs_f64() * 1_000.0,
            &[
                KeyValue::new("method", method.to_string()),
                KeyValue::new("network", network.to_string()),
            ],
        );
    }

    pub fn record_rpc_duration(&self, method: &str, network: &str, duration: Duration) {
        self.rpc_request_duration_ms.record(
            duration.as_secs_f64() * 1_000.0,
            &[
                KeyValue::new("method", method.to_string()),
                KeyValue::new("network", network.to_string()),
            ],
        );
    }

    pub fn record_store_method(&self, method: &str, table: &str, duration: Duration) {
        self.store_method_duration_ms.record(
            duration.as_secs_f64() * 1_000.0,
            &[
                KeyValue::new("method", method.to_string()),
                KeyValue::new("table", table.to_string()),
            ],
        );
    }
}
