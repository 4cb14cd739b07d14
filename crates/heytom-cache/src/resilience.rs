//! Retry + circuit-breaker pipeline guarding far-tier calls.
//!
//! Only the classified transient set (connection, backend, timeout
//! failures — see [`CacheError::is_transient`]) is retried or counted by
//! the breaker. The breaker opens when the failure ratio over a rolling
//! sampling window crosses the threshold after a minimum number of
//! samples, stays open for a fixed duration, then admits a single
//! half-open probe.
//!
//! # State Transitions
//!
//! ```text
//! Closed ── ratio ≥ threshold over window ──▶ Open
//!    ▲                                         │
//!    │ probe succeeds            open duration elapsed
//!    │                                         │
//!    └────────────── HalfOpen ◀────────────────┘
//!                        │
//!                        └── probe fails ──▶ Open (timer reset)
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{CacheError, Result};

/// Retry configuration: exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Base delay for the first retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before retry number `attempt` (zero-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1_u32 << attempt.min(16));
        let max_millis = exp.as_millis().min(u128::from(u64::MAX)) as u64;
        let jittered = rand::thread_rng().gen_range(0..=max_millis);
        Duration::from_millis(jittered)
    }
}

/// Circuit-breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure ratio at which the circuit opens.
    pub failure_ratio: f64,
    /// Rolling window over which the ratio is computed.
    pub sampling_window: Duration,
    /// Samples required before the ratio is consulted.
    pub minimum_throughput: u32,
    /// How long the circuit stays open before admitting a probe.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(10),
            minimum_throughput: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Normal operation; calls flow through.
    Closed = 0,
    /// Calls are short-circuited with [`CacheError::CircuitOpen`].
    Open = 1,
    /// A single probe call is admitted to test recovery.
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// How a call was admitted through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Regular closed-state call.
    Normal,
    /// The half-open probe.
    Probe,
}

/// Failure-ratio circuit breaker over a rolling sampling window.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    /// `(when, failed)` samples inside the rolling window.
    samples: Mutex<VecDeque<(Instant, bool)>>,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            opened_at: Mutex::new(None),
            samples: Mutex::new(VecDeque::new()),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Current state, resolving Open → HalfOpen when the open duration has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let current = BreakerState::from(self.state.load(Ordering::Acquire));
        if current == BreakerState::Open {
            let elapsed = self
                .opened_at
                .lock()
                .expect("breaker lock poisoned")
                .map(|at| at.elapsed());
            if elapsed.is_some_and(|e| e >= self.config.open_duration) {
                self.transition_to_half_open();
                return BreakerState::HalfOpen;
            }
        }
        current
    }

    fn try_acquire(&self) -> Result<Admission> {
        match self.state() {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => Err(CacheError::CircuitOpen),
            BreakerState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(Admission::Probe)
                } else {
                    Err(CacheError::CircuitOpen)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        match admission {
            Admission::Probe => self.transition_to_closed(),
            Admission::Normal => self.push_sample(false),
        }
    }

    fn record_failure(&self, admission: Admission) {
        match admission {
            Admission::Probe => self.transition_to_open(),
            Admission::Normal => {
                self.push_sample(true);
                if self.failure_ratio_exceeded() {
                    self.transition_to_open();
                }
            }
        }
    }

    /// An unclassified outcome passed through: it neither trips nor heals
    /// the circuit, but a held probe slot must be returned.
    fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn push_sample(&self, failed: bool) {
        let now = Instant::now();
        let mut samples = self.samples.lock().expect("breaker lock poisoned");
        samples.push_back((now, failed));
        if let Some(horizon) = now.checked_sub(self.config.sampling_window) {
            while samples.front().is_some_and(|(at, _)| *at < horizon) {
                samples.pop_front();
            }
        }
    }

    fn failure_ratio_exceeded(&self) -> bool {
        let samples = self.samples.lock().expect("breaker lock poisoned");
        let total = samples.len() as u32;
        if total < self.config.minimum_throughput {
            return false;
        }
        let failures = samples.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / f64::from(total) >= self.config.failure_ratio
    }

    fn transition_to_open(&self) {
        self.state.store(BreakerState::Open as u8, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        *self.opened_at.lock().expect("breaker lock poisoned") = Some(Instant::now());
        self.samples.lock().expect("breaker lock poisoned").clear();
    }

    fn transition_to_half_open(&self) {
        self.state
            .store(BreakerState::HalfOpen as u8, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    fn transition_to_closed(&self) {
        self.state
            .store(BreakerState::Closed as u8, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        *self.opened_at.lock().expect("breaker lock poisoned") = None;
        self.samples.lock().expect("breaker lock poisoned").clear();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &BreakerState::from(self.state.load(Ordering::Relaxed)))
            .finish()
    }
}

/// Retry wrapping a circuit breaker over the classified failure set.
#[derive(Debug)]
pub struct ResiliencePipeline {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), BreakerConfig::default())
    }
}

impl ResiliencePipeline {
    /// Create a pipeline from the given policies.
    #[must_use]
    pub fn new(retry: RetryPolicy, breaker: BreakerConfig) -> Self {
        Self {
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    /// Current breaker state (for observability and tests).
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `op` under retry and the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CircuitOpen`] when short-circuited, the last
    /// transient error when retries are exhausted, or the operation's own
    /// error immediately when it is not classified as transient.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let admission = self.breaker.try_acquire()?;
            match op().await {
                Ok(value) => {
                    self.breaker.record_success(admission);
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.record_failure(admission);
                    if attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying far-tier operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.breaker.release(admission);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn fast_pipeline(breaker: BreakerConfig) -> ResiliencePipeline {
        ResiliencePipeline::new(
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
            },
            breaker,
        )
    }

    fn lenient_breaker() -> BreakerConfig {
        BreakerConfig {
            minimum_throughput: 1000,
            ..BreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let pipeline = fast_pipeline(lenient_breaker());
        let result: Result<i32> = pipeline.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let pipeline = fast_pipeline(lenient_breaker());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = pipeline
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CacheError::connection("refused"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_last_error() {
        let pipeline = fast_pipeline(lenient_breaker());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::Timeout { elapsed_ms: 1 })
                }
            })
            .await;
        assert!(matches!(result, Err(CacheError::Timeout { .. })));
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let pipeline = fast_pipeline(lenient_breaker());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::invalid_key("empty"))
                }
            })
            .await;
        assert!(matches!(result, Err(CacheError::InvalidKey { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_at_failure_ratio() {
        let pipeline = fast_pipeline(BreakerConfig {
            minimum_throughput: 5,
            open_duration: Duration::from_secs(30),
            ..BreakerConfig::default()
        });
        // Every attempt fails; retries alone push the sample count past
        // the minimum throughput and trip the breaker.
        let result: Result<()> = pipeline
            .execute(|| async { Err(CacheError::connection("down")) })
            .await;
        assert!(result.is_err());
        let _: Result<()> = pipeline
            .execute(|| async { Err(CacheError::connection("down")) })
            .await;
        assert_eq!(pipeline.breaker_state(), BreakerState::Open);

        // Short-circuited without touching the operation.
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(CacheError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let pipeline = fast_pipeline(BreakerConfig {
            minimum_throughput: 2,
            open_duration: Duration::from_millis(20),
            ..BreakerConfig::default()
        });
        let _: Result<()> = pipeline
            .execute(|| async { Err(CacheError::connection("down")) })
            .await;
        assert_eq!(pipeline.breaker_state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pipeline.breaker_state(), BreakerState::HalfOpen);

        let result: Result<i32> = pipeline.execute(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(pipeline.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_reopens_on_failure() {
        let pipeline = ResiliencePipeline::new(
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
            },
            BreakerConfig {
                minimum_throughput: 1,
                open_duration: Duration::from_millis(20),
                ..BreakerConfig::default()
            },
        );
        let _: Result<()> = pipeline
            .execute(|| async { Err(CacheError::connection("down")) })
            .await;
        assert_eq!(pipeline.breaker_state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _: Result<()> = pipeline
            .execute(|| async { Err(CacheError::connection("still down")) })
            .await;
        assert_eq!(pipeline.breaker_state(), BreakerState::Open);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let cap = policy.base_delay * (1 << attempt);
            for _ in 0..32 {
                assert!(policy.delay_for(attempt) <= cap);
            }
        }
    }

    #[test]
    fn test_minimum_throughput_gates_ratio() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            minimum_throughput: 5,
            ..BreakerConfig::default()
        });
        for _ in 0..4 {
            breaker.record_failure(Admission::Normal);
        }
        // Four failures out of four samples, but below minimum throughput.
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure(Admission::Normal);
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
