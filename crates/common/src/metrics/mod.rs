//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram,
    gauge, histogram, Unit,
};
use std::time::Instant;

/// Metrics prefix for all Ragline metrics
pub const METRICS_PREFIX: &str = "ragline";

/// SLO-aligned histogram buckets for request latency (in seconds)
/// Targets: P50 < 50ms, P99 < 150ms
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - P50 target
    0.075,  // 75ms
    0.100,  // 100ms
    0.150,  // 150ms - P99 target
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Buckets for generation latency (token streams run long)
pub const GENERATION_BUCKETS: &[f64] = &[
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
    120.0,  // 120s
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

    // Stream metrics
    describe_counter!(
        format!("{}_streams_opened_total", METRICS_PREFIX),
        Unit::Count,
        "Total session streams registered"
    );

    describe_counter!(
        format!("{}_streams_closed_total", METRICS_PREFIX),
        Unit::Count,
        "Total session streams closed, by reason"
    );

    describe_gauge!(
        format!("{}_streams_active", METRICS_PREFIX),
        Unit::Count,
        "Session streams currently registered"
    );

    describe_counter!(
        format!("{}_frames_sent_total", METRICS_PREFIX),
        Unit::Count,
        "Total stream frames delivered, by event"
    );

    // Retrieval metrics
    describe_counter!(
        format!("{}_retrieval_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total retrieval queries"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Hybrid retrieval latency in seconds"
    );

    describe_gauge!(
        format!("{}_retrieval_candidates_count", METRICS_PREFIX),
        Unit::Count,
        "Candidates surviving merge and score filter"
    );

    describe_histogram!(
        format!("{}_rerank_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Rerank call latency in seconds"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation requests"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generation stream latency in seconds"
    );

    describe_counter!(
        format!("{}_generation_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation tokens received, by lane"
    );

    // Persistence metrics
    describe_counter!(
        format!("{}_turns_persisted_total", METRICS_PREFIX),
        Unit::Count,
        "Total completed turns persisted"
    );

    describe_counter!(
        format!("{}_persistence_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Total post-stream persistence failures"
    );

    // Database metrics
    describe_gauge!(
        format!("{}_db_connections_active", METRICS_PREFIX),
        Unit::Count,
        "Active database connections"
    );

    describe_histogram!(
        format!("{}_db_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Database query latency in seconds"
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

/// Helper to record stream lifecycle changes
pub fn record_stream_opened(active: usize) {
    counter!(format!("{}_streams_opened_total", METRICS_PREFIX)).increment(1);
    gauge!(format!("{}_streams_active", METRICS_PREFIX)).set(active as f64);
}

/// Helper to record stream closure with its reason
pub fn record_stream_closed(reason: &'static str, active: usize) {
    counter!(
        format!("{}_streams_closed_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(1);
    gauge!(format!("{}_streams_active", METRICS_PREFIX)).set(active as f64);
}

/// Helper to record a delivered stream frame
pub fn record_frame(event: &str) {
    counter!(
        format!("{}_frames_sent_total", METRICS_PREFIX),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Helper to record hybrid retrieval metrics
pub fn record_retrieval(duration_secs: f64, candidate_count: usize) {
    counter!(format!("{}_retrieval_queries_total", METRICS_PREFIX)).increment(1);

    histogram!(format!("{}_retrieval_duration_seconds", METRICS_PREFIX))
        .record(duration_secs);

    gauge!(format!("{}_retrieval_candidates_count", METRICS_PREFIX))
        .set(candidate_count as f64);
}

/// Helper to record rerank latency
pub fn record_rerank(duration_secs: f64) {
    histogram!(format!("{}_rerank_duration_seconds", METRICS_PREFIX))
        .record(duration_secs);
}

/// Helper to record generation metrics
pub fn record_generation(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Helper to record generation tokens by lane
pub fn record_tokens(lane: &'static str, count: usize) {
    counter!(
        format!("{}_generation_tokens_total", METRICS_PREFIX),
        "lane" => lane
    )
    .increment(count as u64);
}

/// Helper to record persistence outcomes
pub fn record_persistence(success: bool) {
    if success {
        counter!(format!("{}_turns_persisted_total", METRICS_PREFIX)).increment(1);
    } else {
        counter!(format!("{}_persistence_failures_total", METRICS_PREFIX)).increment(1);
    }
}
