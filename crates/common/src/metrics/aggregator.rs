//! In-process query metrics
//!
//! All counters live behind one short critical section so a snapshot
//! never mixes the numerator of one update with the denominator of
//! another. Each update is also mirrored to the Prometheus facade.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{AppError, Result};

/// Point-in-time view of aggregated query metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub total_queries: u64,
    /// Sum of end-to-end latencies in milliseconds
    pub total_latency_ms: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Subset of `cache_hits` that joined an in-flight computation
    pub coalesced: u64,
    pub degraded: u64,
    pub failures: u64,
    pub complexity_counts: BTreeMap<String, u64>,
    pub feedback_count: u64,
    pub rating_sum: u64,

    // Derived from the fields above at snapshot time
    pub average_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub average_rating: f64,
}

/// Outcome of one top-level query, as seen by its caller
#[derive(Debug, Clone, Copy)]
pub struct QueryObservation<'a> {
    pub latency: Duration,
    pub from_cache: bool,
    pub coalesced: bool,
    pub degraded: bool,
    pub complexity: &'a str,
}

#[derive(Debug, Default)]
struct Counters {
    total_queries: u64,
    total_latency_ms: u64,
    cache_hits: u64,
    cache_misses: u64,
    coalesced: u64,
    degraded: u64,
    failures: u64,
    complexity_counts: BTreeMap<String, u64>,
    feedback_count: u64,
    rating_sum: u64,
}

/// Aggregates per-query counters and feedback ratings
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    counters: Mutex<Counters>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed query
    pub fn record(&self, latency: Duration, from_cache: bool, complexity: &str) {
        self.observe(QueryObservation {
            latency,
            from_cache,
            coalesced: false,
            degraded: false,
            complexity,
        });
    }

    /// Record a completed query with its full outcome
    pub fn observe(&self, observation: QueryObservation<'_>) {
        {
            let mut counters = self.counters.lock();
            counters.total_queries += 1;
            counters.total_latency_ms += observation.latency.as_millis() as u64;
            if observation.from_cache {
                counters.cache_hits += 1;
            } else {
                counters.cache_misses += 1;
            }
            if observation.coalesced {
                counters.coalesced += 1;
            }
            if observation.degraded {
                counters.degraded += 1;
            }
            *counters
                .complexity_counts
                .entry(observation.complexity.to_string())
                .or_insert(0) += 1;
        }

        super::record_query(
            observation.latency.as_secs_f64(),
            observation.from_cache,
            observation.complexity,
        );
    }

    /// Record a query that failed before producing an answer
    pub fn record_failure(&self) {
        self.counters.lock().failures += 1;
        metrics::counter!(format!("{}_query_failures_total", super::METRICS_PREFIX)).increment(1);
    }

    /// Record a user rating
    pub fn record_feedback(&self, rating: u8) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::InvalidRating { rating });
        }

        {
            let mut counters = self.counters.lock();
            counters.feedback_count += 1;
            counters.rating_sum += u64::from(rating);
        }

        metrics::histogram!(format!("{}_feedback_rating", super::METRICS_PREFIX))
            .record(f64::from(rating));
        Ok(())
    }

    /// Consistent point-in-time view
    pub fn snapshot(&self) -> QueryMetrics {
        let counters = self.counters.lock();

        let average_latency_ms = ratio(counters.total_latency_ms, counters.total_queries);
        let cache_hit_rate = ratio(counters.cache_hits, counters.cache_hits + counters.cache_misses);
        let average_rating = ratio(counters.rating_sum, counters.feedback_count);

        QueryMetrics {
            total_queries: counters.total_queries,
            total_latency_ms: counters.total_latency_ms,
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            coalesced: counters.coalesced,
            degraded: counters.degraded,
            failures: counters.failures,
            complexity_counts: counters.complexity_counts.clone(),
            feedback_count: counters.feedback_count,
            rating_sum: counters.rating_sum,
            average_latency_ms,
            cache_hit_rate,
            average_rating,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_hits_and_misses() {
        let metrics = MetricsAggregator::new();
        metrics.record(Duration::from_millis(100), false, "simple");
        metrics.record(Duration::from_millis(10), true, "simple");
        metrics.record(Duration::from_millis(40), true, "complex");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 3);
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.total_latency_ms, 150);
        assert_eq!(snapshot.average_latency_ms, 50.0);
        assert_eq!(snapshot.complexity_counts["simple"], 2);
        assert_eq!(snapshot.complexity_counts["complex"], 1);
        assert!((snapshot.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot_has_zero_averages() {
        let snapshot = MetricsAggregator::new().snapshot();
        assert_eq!(snapshot.average_latency_ms, 0.0);
        assert_eq!(snapshot.cache_hit_rate, 0.0);
        assert_eq!(snapshot.average_rating, 0.0);
    }

    #[test]
    fn test_feedback_rating_bounds() {
        let metrics = MetricsAggregator::new();
        assert!(matches!(metrics.record_feedback(0), Err(AppError::InvalidRating { rating: 0 })));
        assert!(metrics.record_feedback(6).is_err());

        metrics.record_feedback(3).unwrap();
        metrics.record_feedback(5).unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.feedback_count, 2);
        assert_eq!(snapshot.average_rating, 4.0);
    }

    #[test]
    fn test_concurrent_updates_stay_consistent() {
        let metrics = Arc::new(MetricsAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let hit = (worker + i) % 2 == 0;
                        metrics.record(Duration::from_millis(2), hit, "moderate");
                        let snapshot = metrics.snapshot();
                        // Every snapshot must balance
                        assert_eq!(snapshot.cache_hits + snapshot.cache_misses, snapshot.total_queries);
                        assert_eq!(snapshot.total_latency_ms, snapshot.total_queries * 2);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 2_000);
        assert_eq!(snapshot.cache_hits, 1_000);
        assert_eq!(snapshot.complexity_counts["moderate"], 2_000);
    }
}
