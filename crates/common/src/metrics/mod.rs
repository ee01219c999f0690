//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions, plus the in-process
//! [`MetricsAggregator`] behind the metrics API.

mod aggregator;

pub use aggregator::{MetricsAggregator, QueryMetrics, QueryObservation};

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram,
    gauge, histogram, Unit,
};

/// Metrics prefix for all LexForge metrics
pub const METRICS_PREFIX: &str = "lexforge";

/// SLO-aligned histogram buckets for end-to-end query latency (in seconds)
/// Targets: cached P50 < 50ms, generated P99 < 10s
pub const QUERY_LATENCY_BUCKETS: &[f64] = &[
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - cached P50 target
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s - generated P99 target
    30.00,  // 30s
];

/// Buckets for upstream calls (index, embedding, generation)
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Query metrics
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of completed queries"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end query latency in seconds"
    );

    describe_counter!(
        format!("{}_query_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Queries that ended in an error"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Queries answered without running a computation"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Queries that ran a computation"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Hybrid retrieval latency in seconds"
    );

    describe_gauge!(
        format!("{}_retrieval_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of documents returned from the last retrieval"
    );

    describe_counter!(
        format!("{}_retrieval_degraded_total", METRICS_PREFIX),
        Unit::Count,
        "Retrievals that lost one or both index legs"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Generation provider calls"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generation latency in seconds"
    );

    // Routing metrics
    describe_counter!(
        format!("{}_routing_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "Routing decisions by query type"
    );

    // Feedback
    describe_histogram!(
        format!("{}_feedback_rating", METRICS_PREFIX),
        Unit::Count,
        "User feedback ratings (1-5)"
    );

    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Sessions held in conversational memory"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record a completed query
pub fn record_query(duration_secs: f64, from_cache: bool, complexity: &str) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "complexity" => complexity.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        "cached" => from_cache.to_string()
    )
    .record(duration_secs);

    record_cache(from_cache, "answers");
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

/// Helper to record retrieval metrics
pub fn record_retrieval(duration_secs: f64, status: &str, result_count: usize) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);

    gauge!(format!("{}_retrieval_results_count", METRICS_PREFIX)).set(result_count as f64);

    if status != "complete" {
        counter!(
            format!("{}_retrieval_degraded_total", METRICS_PREFIX),
            "status" => status.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a generation provider call
pub fn record_generation(duration_secs: f64, provider: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "provider" => provider.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_generation_duration_seconds", METRICS_PREFIX),
            "provider" => provider.to_string()
        )
        .record(duration_secs);
    }
}

/// Helper to record a routing decision
pub fn record_routing(query_type: &str, classified: bool) {
    counter!(
        format!("{}_routing_decisions_total", METRICS_PREFIX),
        "query_type" => query_type.to_string(),
        "classified" => classified.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        // Verify buckets are sorted
        for buckets in [QUERY_LATENCY_BUCKETS, UPSTREAM_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }

        // Cached P50 target (50ms) should be in buckets
        assert!(QUERY_LATENCY_BUCKETS.contains(&0.050));
    }

    #[test]
    fn test_helpers_without_recorder() {
        // No recorder installed: the facade must accept calls silently
        record_query(0.12, false, "simple");
        record_retrieval(0.03, "partial", 2);
        record_generation(1.5, "primary", true);
        record_routing("legal", true);
    }
}
