//! Prometheus metrics
//!
//! Counters are registered lazily on first touch and exposed on
//! `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    /// Inbound activities by type
    pub static ref ACTIVITIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_activities_total",
        "Inbound activities processed, by activity type",
        &["type"]
    )
    .expect("metric registration");

    /// Outbound delivery attempts by outcome
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_deliveries_total",
        "Outbound delivery attempts, by outcome",
        &["outcome"]
    )
    .expect("metric registration");

    /// Errors surfaced to HTTP responses, by kind
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_errors_total",
        "Errors returned to clients, by kind",
        &["type"]
    )
    .expect("metric registration");
}

/// Force registration at startup so the scrape page is never empty
pub fn init_metrics() {
    lazy_static::initialize(&ACTIVITIES_TOTAL);
    lazy_static::initialize(&DELIVERIES_TOTAL);
    lazy_static::initialize(&ERRORS_TOTAL);
}

/// Render the default registry in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(error) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(%error, "Metrics encoding failed");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
