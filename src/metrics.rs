use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{register_gauge_vec, register_histogram_vec, GaugeVec, HistogramVec};

/// Value of the `decision` label when a request was allowed.
pub const ALLOWED: &str = "allowed";

/// Value of the `decision` label when a request was denied.
pub const DENIED: &str = "denied";

lazy_static! {
    pub static ref SPEND_LATENCY: HistogramVec = register_histogram_vec!(
        "ratelimits_spend_latency",
        "Latency of rate limit checks labeled by limit name and decision=[allowed|denied], in seconds",
        &["limit", "decision"],
        // Exponential buckets ranging from 0.0005s to ~3s.
        prometheus::exponential_buckets(0.0005, 3.0, 8).unwrap()
    )
    .unwrap();

    pub static ref SOURCE_LATENCY: HistogramVec = register_histogram_vec!(
        "ratelimits_latency",
        "Latency of source calls labeled by call=[get|set|delete|ping|batchget|batchset] and result, in seconds",
        &["call", "result"],
        prometheus::exponential_buckets(0.0005, 3.0, 8).unwrap()
    )
    .unwrap();

    pub static ref OVERRIDE_USAGE: GaugeVec = register_gauge_vec!(
        "ratelimits_override_usage",
        "Proportion of override limit used, by limit name and bucket key",
        &["limit", "bucket_key"]
    )
    .unwrap();
}

/// Record the latency of a spend decision.
pub fn record_spend_latency(limit: &str, decision: &str, elapsed: Duration) {
    SPEND_LATENCY
        .with_label_values(&[limit, decision])
        .observe(elapsed.as_secs_f64());
}

/// Record the latency and classified result of one source call.
pub fn record_source_call(call: &str, result: &str, elapsed: Duration) {
    SOURCE_LATENCY
        .with_label_values(&[call, result])
        .observe(elapsed.as_secs_f64());
}

/// Set the utilization gauge for an override limit, in `[0, 1]`.
pub fn set_override_utilization(limit: &str, bucket_key: &str, utilization: f64) {
    OVERRIDE_USAGE
        .with_label_values(&[limit, bucket_key])
        .set(utilization);
}
