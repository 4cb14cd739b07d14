//! Cache metrics: lifetime counters with a consistent snapshot, plus
//! emission through the `metrics` facade for external exporters.
//!
//! The counters are plain atomics so `snapshot()` never depends on an
//! installed recorder; the facade emission is an additive side channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_REQUESTS: &str = "cache.requests";
    pub const CACHE_HITS: &str = "cache.hits";
    pub const CACHE_MISSES: &str = "cache.misses";
    pub const CACHE_OPERATION_DURATION: &str = "cache.operation.duration";
}

/// Which tier satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTier {
    /// The in-process near tier.
    Near,
    /// The shared far tier.
    Far,
}

impl HitTier {
    fn as_str(self) -> &'static str {
        match self {
            HitTier::Near => "local",
            HitTier::Far => "redis",
        }
    }
}

/// Lifetime counters for the hybrid cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    enabled: bool,
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    near_hits: AtomicU64,
    far_hits: AtomicU64,
    duration_micros: AtomicU64,
    duration_samples: AtomicU64,
}

impl CacheMetrics {
    /// Create a metrics sink. When `enabled` is false every record call is
    /// a no-op and the snapshot stays at zero.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Record a request satisfied by `tier`.
    pub fn record_hit(&self, tier: HitTier, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            HitTier::Near => self.near_hits.fetch_add(1, Ordering::Relaxed),
            HitTier::Far => self.far_hits.fetch_add(1, Ordering::Relaxed),
        };
        self.record_duration(duration);

        counter!(names::CACHE_REQUESTS).increment(1);
        counter!(names::CACHE_HITS, "cache.type" => tier.as_str()).increment(1);
        histogram!(
            names::CACHE_OPERATION_DURATION,
            "cache.result" => "hit",
            "cache.type" => tier.as_str()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a request that missed both tiers.
    pub fn record_miss(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);

        counter!(names::CACHE_REQUESTS).increment(1);
        counter!(names::CACHE_MISSES).increment(1);
        histogram!(names::CACHE_OPERATION_DURATION, "cache.result" => "miss")
            .record(duration.as_secs_f64());
    }

    /// Record the duration of a non-read operation (`set`, `remove`,
    /// `refresh`). These do not contribute to hit/miss counters.
    pub fn record_operation(&self, operation: &'static str, duration: Duration) {
        if !self.enabled {
            return;
        }
        histogram!(
            names::CACHE_OPERATION_DURATION,
            "cache.operation" => operation
        )
        .record(duration.as_secs_f64());
    }

    fn record_duration(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.duration_micros.fetch_add(micros, Ordering::Relaxed);
        self.duration_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// A consistent view of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.duration_samples.load(Ordering::Relaxed);
        let micros = self.duration_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            near_hits: self.near_hits.load(Ordering::Relaxed),
            far_hits: self.far_hits.load(Ordering::Relaxed),
            avg_duration_ms: if samples > 0 {
                (micros as f64 / samples as f64) / 1000.0
            } else {
                0.0
            },
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.near_hits.store(0, Ordering::Relaxed);
        self.far_hits.store(0, Ordering::Relaxed);
        self.duration_micros.store(0, Ordering::Relaxed);
        self.duration_samples.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub near_hits: u64,
    pub far_hits: u64,
    pub avg_duration_ms: f64,
}

impl MetricsSnapshot {
    /// `hits / total_requests`, or 0 when nothing was requested yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.hits as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_hits_sum_to_hits() {
        let metrics = CacheMetrics::new(true);
        metrics.record_hit(HitTier::Near, Duration::from_micros(10));
        metrics.record_hit(HitTier::Far, Duration::from_micros(20));
        metrics.record_hit(HitTier::Near, Duration::from_micros(30));
        metrics.record_miss(Duration::from_micros(40));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.near_hits, 2);
        assert_eq!(snapshot.far_hits, 1);
        assert_eq!(snapshot.near_hits + snapshot.far_hits, snapshot.hits);
    }

    #[test]
    fn test_hit_rate_identity() {
        let metrics = CacheMetrics::new(true);
        assert_eq!(metrics.snapshot().hit_rate(), 0.0);

        metrics.record_hit(HitTier::Near, Duration::ZERO);
        metrics.record_miss(Duration::ZERO);
        let snapshot = metrics.snapshot();
        assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_avg_duration() {
        let metrics = CacheMetrics::new(true);
        metrics.record_hit(HitTier::Near, Duration::from_millis(2));
        metrics.record_miss(Duration::from_millis(4));
        let snapshot = metrics.snapshot();
        assert!((snapshot.avg_duration_ms - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new(true);
        metrics.record_hit(HitTier::Far, Duration::from_micros(5));
        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.avg_duration_ms, 0.0);
    }

    #[test]
    fn test_disabled_sink_stays_zero() {
        let metrics = CacheMetrics::new(false);
        metrics.record_hit(HitTier::Near, Duration::from_micros(5));
        metrics.record_miss(Duration::from_micros(5));
        assert_eq!(metrics.snapshot().total_requests, 0);
    }
}
