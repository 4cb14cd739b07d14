//! The hybrid cache coordinator.
//!
//! Composes the near tier, the far store, the resilience pipeline, the
//! invalidation transport, and the metrics sink into the public key/value
//! contract:
//!
//! ```text
//! GET  → near tier → far tier (via pipeline) → write-through to near
//! SET  → far tier (via pipeline) → near tier → async invalidation event
//! ```
//!
//! Within a single operation on one key, far-tier effects precede
//! near-tier effects. Across operations and instances ordering is not
//! guaranteed; near tiers converge after invalidation delivery or entry
//! expiry. When the far tier is unavailable and the near tier is enabled,
//! reads and writes degrade to the near tier alone (logged at warn);
//! without a near tier they fail with [`CacheError::Unavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::expiration::{Effective, Expiration};
use crate::far::{FarStore, MessageHandler, Subscription, sliding_metadata_key};
use crate::invalidation::{
    InvalidationEvent, InvalidationHandler, InvalidationPublisher, InvalidationSubscriber,
    StoreInvalidator,
};
use crate::metrics::{CacheMetrics, HitTier, MetricsSnapshot};
use crate::near::NearCache;
use crate::resilience::{BreakerConfig, ResiliencePipeline, RetryPolicy};

/// Two-tier cache coordinator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    far: Arc<dyn FarStore>,
    near: Option<Arc<NearCache>>,
    pipeline: ResiliencePipeline,
    metrics: CacheMetrics,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    subscriber: Option<Arc<dyn InvalidationSubscriber>>,
    disposed: AtomicBool,
}

/// Builder for [`HybridCache`].
pub struct HybridCacheBuilder {
    config: CacheConfig,
    far: Option<Arc<dyn FarStore>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    subscriber: Option<Arc<dyn InvalidationSubscriber>>,
    retry: RetryPolicy,
    breaker: BreakerConfig,
}

impl HybridCacheBuilder {
    /// Start a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            far: None,
            publisher: None,
            subscriber: None,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the far-tier store (required).
    #[must_use]
    pub fn far_store(mut self, far: Arc<dyn FarStore>) -> Self {
        self.far = Some(far);
        self
    }

    /// Override the invalidation publisher. Defaults to the on-store
    /// transport on the configured channel.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn InvalidationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Override the invalidation subscriber. Defaults to the on-store
    /// transport on the configured channel.
    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn InvalidationSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the circuit-breaker configuration.
    #[must_use]
    pub fn breaker_config(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Build the coordinator and install the invalidation subscription.
    ///
    /// Subscription failures are logged and do not fail construction: the
    /// far tier stays the source of truth, the near tier just serves
    /// staler entries until the transport recovers.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when the configuration is
    /// invalid or no far store was provided.
    pub async fn build(self) -> Result<HybridCache> {
        self.config.validate()?;
        let far = self
            .far
            .ok_or_else(|| CacheError::configuration("a far store is required"))?;

        let near = self.config.near_enabled.then(|| {
            Arc::new(NearCache::new(
                self.config.near_max_size,
                self.config.near_default_ttl,
            ))
        });

        let (publisher, subscriber) = if self.config.invalidation_active() {
            match (self.publisher, self.subscriber) {
                (Some(p), Some(s)) => (Some(p), Some(s)),
                (p, s) => {
                    let transport = Arc::new(StoreInvalidator::new(
                        Arc::clone(&far),
                        self.config.invalidation_channel.clone(),
                    ));
                    let publisher: Arc<dyn InvalidationPublisher> = match p {
                        Some(p) => p,
                        None => Arc::clone(&transport) as Arc<dyn InvalidationPublisher>,
                    };
                    let subscriber: Arc<dyn InvalidationSubscriber> = match s {
                        Some(s) => s,
                        None => transport,
                    };
                    (Some(publisher), Some(subscriber))
                }
            }
        } else {
            (None, None)
        };

        if let (Some(subscriber), Some(near)) = (&subscriber, &near) {
            let handler = invalidation_handler(Arc::clone(near), self.config.instance_name.clone());
            if let Err(e) = subscriber.subscribe(handler).await {
                tracing::warn!(
                    error = %e,
                    channel = %self.config.invalidation_channel,
                    "failed to install invalidation subscription; near tiers will rely on TTLs"
                );
            }
        }

        let metrics = CacheMetrics::new(self.config.metrics_enabled);

        Ok(HybridCache {
            inner: Arc::new(Inner {
                config: self.config,
                far,
                near,
                pipeline: ResiliencePipeline::new(self.retry, self.breaker),
                metrics,
                publisher,
                subscriber,
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for HybridCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The handler installed on the invalidation subscription: drops the key
/// from the local near tier only. It receives a narrow near-tier
/// reference, never the coordinator, and never re-publishes. Events
/// carrying this instance's own source name are skipped so a write does
/// not erase its author's fresh near entry.
fn invalidation_handler(
    near: Arc<NearCache>,
    instance_name: Option<String>,
) -> InvalidationHandler {
    Arc::new(move |event: InvalidationEvent| {
        if event.key.is_empty() {
            return;
        }
        if instance_name.is_some() && event.source == instance_name {
            tracing::trace!(key = %event.key, "skipping own invalidation event");
            return;
        }
        let dropped = near.invalidate(&event.key);
        tracing::debug!(
            key = %event.key,
            kind = %event.kind,
            source = event.source.as_deref().unwrap_or("unknown"),
            dropped,
            "received invalidation"
        );
    })
}

impl HybridCache {
    /// Start building a coordinator.
    #[must_use]
    pub fn builder() -> HybridCacheBuilder {
        HybridCacheBuilder::new()
    }

    // ==================== Key/Value ====================

    /// Look up `key`: near tier first, then the far tier through the
    /// resilience pipeline. A far hit is written through to the near tier
    /// with the configured default expiration (intentionally not the far
    /// tier's remaining TTL). When the far tier is unavailable and the
    /// near tier is enabled, a potentially stale near value (or `None`)
    /// is returned instead of an error.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>> {
        self.ensure_live()?;
        validate_key(key)?;
        let started = Instant::now();
        let inner = &self.inner;

        if let Some(near) = &inner.near {
            if let Some(value) = near.get(key) {
                inner.metrics.record_hit(HitTier::Near, started.elapsed());
                return Ok(Some(value));
            }
        }

        let far_result = self
            .run_far(|| async { inner.far.get(key).await })
            .await;

        match far_result {
            Ok(Some(bytes)) => {
                let value = Arc::new(bytes);
                if let Some(near) = &inner.near {
                    near.set(key, Arc::clone(&value), Effective {
                        initial_ttl: None,
                        absolute: None,
                        sliding: None,
                    });
                }
                inner.metrics.record_hit(HitTier::Far, started.elapsed());
                Ok(Some(value))
            }
            Ok(None) => {
                inner.metrics.record_miss(started.elapsed());
                Ok(None)
            }
            Err(e) if e.is_degradable() => match &inner.near {
                Some(near) => {
                    tracing::warn!(key = %key, error = %e, "far tier unavailable; serving from near tier");
                    match near.get(key) {
                        Some(value) => {
                            inner.metrics.record_hit(HitTier::Near, started.elapsed());
                            Ok(Some(value))
                        }
                        None => {
                            inner.metrics.record_miss(started.elapsed());
                            Ok(None)
                        }
                    }
                }
                None => Err(CacheError::unavailable(e)),
            },
            Err(e) => Err(e),
        }
    }

    /// Store `value` at `key`: far tier first (primary entry plus the
    /// sliding-metadata sibling when a sliding window is set, sharing one
    /// TTL), then the near tier, then a fire-and-forget `Update`
    /// invalidation event. When the far tier is unavailable and the near
    /// tier is enabled, the write lands in the near tier only and the
    /// call returns normally.
    pub async fn set(&self, key: &str, value: Vec<u8>, expiration: Expiration) -> Result<()> {
        self.ensure_live()?;
        validate_key(key)?;
        let started = Instant::now();
        let inner = &self.inner;
        let effective = expiration.resolve(time::OffsetDateTime::now_utc())?;
        let value = Arc::new(value);

        let far_value = Arc::clone(&value);
        let far_result = self
            .run_far(|| {
                let value = Arc::clone(&far_value);
                async move {
                    inner.far.set(key, &value, effective.initial_ttl).await?;
                    if let Some(window) = effective.sliding {
                        let seconds = window.as_secs().max(1).to_string();
                        inner
                            .far
                            .set(
                                &sliding_metadata_key(key),
                                seconds.as_bytes(),
                                effective.initial_ttl,
                            )
                            .await?;
                    }
                    Ok(())
                }
            })
            .await;

        match far_result {
            Ok(()) => {
                if let Some(near) = &inner.near {
                    near.set(key, value, effective);
                }
                self.emit_invalidation(InvalidationEvent::update(
                    key,
                    inner.config.instance_name.clone(),
                ));
                inner.metrics.record_operation("set", started.elapsed());
                Ok(())
            }
            Err(e) if e.is_degradable() => match &inner.near {
                Some(near) => {
                    tracing::warn!(key = %key, error = %e, "far tier unavailable; write kept in near tier only");
                    near.set(key, value, effective);
                    inner.metrics.record_operation("set", started.elapsed());
                    Ok(())
                }
                None => Err(CacheError::unavailable(e)),
            },
            Err(e) => Err(e),
        }
    }

    /// Remove `key` from both tiers (the far delete covers the primary
    /// key and its sliding-metadata sibling in one atomic multi-key
    /// command), then emit a fire-and-forget `Remove` event.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_live()?;
        validate_key(key)?;
        let started = Instant::now();
        let inner = &self.inner;
        let metadata_key = sliding_metadata_key(key);

        let far_result = self
            .run_far(|| {
                let metadata_key = metadata_key.clone();
                async move { inner.far.remove(&[key, metadata_key.as_str()]).await }
            })
            .await;

        match far_result {
            Ok(_) => {
                if let Some(near) = &inner.near {
                    near.remove(key);
                }
                self.emit_invalidation(InvalidationEvent::remove(
                    key,
                    inner.config.instance_name.clone(),
                ));
                inner.metrics.record_operation("remove", started.elapsed());
                Ok(())
            }
            Err(e) if e.is_degradable() => match &inner.near {
                Some(near) => {
                    tracing::warn!(key = %key, error = %e, "far tier unavailable; removed from near tier only");
                    near.remove(key);
                    inner.metrics.record_operation("remove", started.elapsed());
                    Ok(())
                }
                None => Err(CacheError::unavailable(e)),
            },
            Err(e) => Err(e),
        }
    }

    /// Bump the sliding TTL of `key` in both tiers. Best-effort: when the
    /// entry has expired or carries no sliding metadata this returns
    /// quietly.
    pub async fn refresh(&self, key: &str) -> Result<()> {
        self.ensure_live()?;
        validate_key(key)?;
        let started = Instant::now();
        let inner = &self.inner;
        let metadata_key = sliding_metadata_key(key);

        let far_result = self
            .run_far(|| {
                let metadata_key = metadata_key.clone();
                async move {
                    let Some(raw) = inner.far.get(&metadata_key).await? else {
                        return Ok(());
                    };
                    let Some(seconds) = std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|s| s.trim().parse::<u64>().ok())
                    else {
                        tracing::warn!(key = %metadata_key, "unparseable sliding metadata; skipping refresh");
                        return Ok(());
                    };
                    let window = Duration::from_secs(seconds);
                    inner.far.expire(key, window).await?;
                    inner.far.expire(&metadata_key, window).await?;
                    Ok(())
                }
            })
            .await;

        match far_result {
            Ok(()) => {}
            Err(e) if e.is_degradable() && inner.near.is_some() => {
                tracing::warn!(key = %key, error = %e, "far tier unavailable; refreshing near tier only");
            }
            Err(e) if e.is_degradable() => return Err(CacheError::unavailable(e)),
            Err(e) => return Err(e),
        }

        if let Some(near) = &inner.near {
            near.refresh(key);
        }
        inner.metrics.record_operation("refresh", started.elapsed());
        Ok(())
    }

    // ==================== Hash ====================

    /// Set `field` of the far-tier hash at `key`.
    pub async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.far_delegate(key, || async { self.inner.far.hash_set(key, field, value).await })
            .await
    }

    /// Read `field` of the far-tier hash at `key`.
    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.far_delegate(key, || async { self.inner.far.hash_get(key, field).await })
            .await
    }

    /// Read every field of the far-tier hash at `key`.
    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.far_delegate(key, || async { self.inner.far.hash_get_all(key).await })
            .await
    }

    /// Delete `field` from the far-tier hash at `key`.
    pub async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.far_delegate(key, || async { self.inner.far.hash_delete(key, field).await })
            .await
    }

    // ==================== List (FIFO) ====================

    /// Append `value` to the tail of the far-tier list at `key`.
    pub async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.far_delegate(key, || async { self.inner.far.list_push(key, value).await })
            .await
    }

    /// Pop the head of the far-tier list at `key`.
    pub async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.far_delegate(key, || async { self.inner.far.list_pop(key).await })
            .await
    }

    /// Length of the far-tier list at `key`.
    pub async fn list_len(&self, key: &str) -> Result<u64> {
        self.far_delegate(key, || async { self.inner.far.list_len(key).await })
            .await
    }

    // ==================== Set ====================

    /// Add `member` to the far-tier set at `key` (idempotent).
    pub async fn set_add(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.far_delegate(key, || async { self.inner.far.set_add(key, member).await })
            .await
    }

    /// Remove `member` from the far-tier set at `key`.
    pub async fn set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.far_delegate(key, || async { self.inner.far.set_remove(key, member).await })
            .await
    }

    /// Every member of the far-tier set at `key`.
    pub async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.far_delegate(key, || async { self.inner.far.set_members(key).await })
            .await
    }

    // ==================== Sorted set ====================

    /// Add `member` with `score` to the far-tier sorted set at `key`.
    pub async fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        self.far_delegate(key, || async {
            self.inner.far.sorted_add(key, member, score).await
        })
        .await
    }

    /// Members of the far-tier sorted set at `key` with scores in
    /// `[min, max]`, ascending.
    pub async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>> {
        self.far_delegate(key, || async {
            self.inner.far.sorted_range_by_score(key, min, max).await
        })
        .await
    }

    // ==================== Pub/Sub ====================

    /// Publish `payload` on a named far-tier channel.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.far_delegate(channel, || async {
            self.inner.far.publish(channel, payload).await
        })
        .await
    }

    /// Subscribe `handler` to a named far-tier channel. The returned
    /// handle owns the consumer.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_live()?;
        validate_key(channel)?;
        self.inner.far.subscribe(channel, handler).await
    }

    // ==================== Observability ====================

    /// A consistent snapshot of the lifetime counters. Always succeeds
    /// before disposal.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Zero the lifetime counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Whether the near tier is enabled.
    #[must_use]
    pub fn is_near_enabled(&self) -> bool {
        self.inner.near.is_some()
    }

    /// Number of entries resident in the near tier. For diagnostics and
    /// tests.
    #[must_use]
    pub fn near_len(&self) -> usize {
        self.inner.near.as_ref().map_or(0, |near| near.len())
    }

    /// Whether `key` is live in the near tier, without touching recency
    /// or sliding state. For diagnostics and tests.
    #[must_use]
    pub fn near_contains(&self, key: &str) -> bool {
        self.inner
            .near
            .as_ref()
            .is_some_and(|near| near.contains(key))
    }

    // ==================== Lifecycle ====================

    /// Dispose the coordinator: tear down the invalidation subscription,
    /// close the far client, and drop the near tier. Idempotent; later
    /// operations fail with [`CacheError::Disposed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(subscriber) = &self.inner.subscriber {
            if let Err(e) = subscriber.unsubscribe().await {
                tracing::warn!(error = %e, "failed to tear down invalidation subscription");
            }
        }
        if let Err(e) = self.inner.far.close().await {
            tracing::warn!(error = %e, "failed to close far store");
        }
        if let Some(near) = &self.inner.near {
            near.clear();
        }
        tracing::debug!("hybrid cache disposed");
        Ok(())
    }

    // ==================== Internals ====================

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(CacheError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Run a far-tier operation under the per-attempt timeout and the
    /// retry + circuit-breaker pipeline.
    async fn run_far<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let timeout = self.inner.config.far_timeout;
        self.inner
            .pipeline
            .execute(|| {
                let attempt = op();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(CacheError::Timeout {
                            elapsed_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            })
            .await
    }

    /// Delegate a data-structure operation to the far tier. These have no
    /// near-tier representation, so pipeline exhaustion surfaces as
    /// [`CacheError::Unavailable`] regardless of the near tier.
    async fn far_delegate<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.ensure_live()?;
        validate_key(key)?;
        match self.run_far(op).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_degradable() => Err(CacheError::unavailable(e)),
            Err(e) => Err(e),
        }
    }

    /// Emit an invalidation event without blocking the caller or
    /// surfacing transport errors.
    fn emit_invalidation(&self, event: InvalidationEvent) {
        let Some(publisher) = self.inner.publisher.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                tracing::warn!(key = %event.key, error = %e, "failed to publish invalidation event");
            }
        });
    }
}

impl std::fmt::Debug for HybridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("backend", &self.inner.far.backend_name())
            .field("near_enabled", &self.is_near_enabled())
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        Err(CacheError::invalid_key(
            "key must be non-empty and non-whitespace",
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::far::MemoryFarStore;

    async fn build_cache() -> HybridCache {
        HybridCache::builder()
            .far_store(Arc::new(MemoryFarStore::new()))
            .config(CacheConfig {
                far_url: "memory://".to_string(),
                ..CacheConfig::default()
            })
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let cache = build_cache().await;
        assert!(matches!(
            cache.get("").await,
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(matches!(
            cache.set("   ", b"v".to_vec(), Expiration::none()).await,
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(matches!(
            cache.remove(" \t ").await,
            Err(CacheError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let cache = build_cache().await;
        cache.close().await.unwrap();
        // Idempotent.
        cache.close().await.unwrap();

        assert!(matches!(cache.get("k").await, Err(CacheError::Disposed)));
        assert!(matches!(
            cache.set("k", b"v".to_vec(), Expiration::none()).await,
            Err(CacheError::Disposed)
        ));
        assert!(matches!(cache.list_len("k").await, Err(CacheError::Disposed)));
    }

    #[tokio::test]
    async fn test_builder_requires_far_store() {
        let result = HybridCache::builder().build().await;
        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_past_absolute_expiration_rejected_before_any_write() {
        let cache = build_cache().await;
        let past = time::OffsetDateTime::now_utc() - time::Duration::seconds(5);
        let result = cache.set("k", b"v".to_vec(), Expiration::at(past)).await;
        assert!(matches!(result, Err(CacheError::InvalidExpiration { .. })));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
