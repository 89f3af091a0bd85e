//! Thin wrappers around the `metrics` macros so call sites stay one-liners
//! and metric names live in a single place.

use metrics::{counter, histogram};
use std::time::Instant;

/// Count a served request by endpoint and response status.
pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "embeddit_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request latency from `start` to now.
pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("embeddit_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_hit(cache: &'static str) {
    counter!("embeddit_cache_hits_total", "cache" => cache).increment(1);
}

pub fn record_cache_miss(cache: &'static str) {
    counter!("embeddit_cache_misses_total", "cache" => cache).increment(1);
}

/// Count conversion outcomes: "completed", "failed", or "redirected".
pub fn record_conversion(outcome: &'static str) {
    counter!("embeddit_conversions_total", "outcome" => outcome).increment(1);
}
