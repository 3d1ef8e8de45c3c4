//! Metrics and observability utilities
//!
//! Prometheus metrics for the HTTP surface, provider calls, the affiliation
//! cache, and aggregation passes, with standardized naming.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Worldthread metrics
pub const METRICS_PREFIX: &str = "worldthread";

/// Buckets for aggregation passes (dominated by provider pacing)
pub const AGGREGATION_BUCKETS: &[f64] = &[
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    20.0,
    30.0,
    60.0,
    120.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Provider fetch metrics
    describe_counter!(
        format!("{}_fetch_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Retrying fetches by final outcome"
    );

    describe_counter!(
        format!("{}_fetch_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Backoff waits by reason"
    );

    describe_counter!(
        format!("{}_geocode_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Geocoding lookups by outcome"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    describe_gauge!(
        format!("{}_affiliation_cache_entries", METRICS_PREFIX),
        Unit::Count,
        "Affiliations cached, resolved or not"
    );

    // Aggregation metrics
    describe_counter!(
        format!("{}_nodes_emitted_total", METRICS_PREFIX),
        Unit::Count,
        "Visualization nodes emitted per topic"
    );

    describe_counter!(
        format!("{}_topic_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Topics that contributed nothing because of an error"
    );

    describe_histogram!(
        format!("{}_aggregation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Aggregation pass latency in seconds"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Final outcome of a retrying fetch: success, hard_error, exhausted
pub fn record_fetch_outcome(outcome: &str) {
    counter!(
        format!("{}_fetch_requests_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A backoff wait: rate_limited or transient
pub fn record_fetch_retry(reason: &str) {
    counter!(
        format!("{}_fetch_retries_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Geocoding lookup outcome: resolved, empty, error
pub fn record_geocode(outcome: &str) {
    counter!(
        format!("{}_geocode_requests_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

pub fn set_cache_entries(entries: usize) {
    gauge!(format!("{}_affiliation_cache_entries", METRICS_PREFIX)).set(entries as f64);
}

pub fn record_topic_nodes(topic: &str, nodes: usize) {
    counter!(
        format!("{}_nodes_emitted_total", METRICS_PREFIX),
        "topic" => topic.to_string()
    )
    .increment(nodes as u64);
}

pub fn record_topic_failure(topic: &str) {
    counter!(
        format!("{}_topic_failures_total", METRICS_PREFIX),
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Helper to record a completed aggregation pass
pub fn record_aggregation(duration_secs: f64, node_count: usize) {
    histogram!(format!("{}_aggregation_duration_seconds", METRICS_PREFIX)).record(duration_secs);
    tracing::debug!(duration_secs, node_count, "Aggregation recorded");
}
