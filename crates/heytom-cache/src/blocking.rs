//! Blocking mirror of the coordinator API.
//!
//! Owns a private multi-thread runtime so background work (the
//! invalidation subscription, fire-and-forget publishes) keeps running
//! between calls. Semantics are identical to the async surface. Must not
//! be used from inside an async context; the runtime's `block_on` would
//! panic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{HybridCache as AsyncHybridCache, HybridCacheBuilder};
use crate::error::{CacheError, Result};
use crate::expiration::Expiration;
use crate::far::{MessageHandler, Subscription};
use crate::metrics::MetricsSnapshot;

/// Blocking two-tier cache coordinator.
pub struct HybridCache {
    runtime: tokio::runtime::Runtime,
    inner: AsyncHybridCache,
}

impl HybridCache {
    /// Build the coordinator from `builder` on a private runtime.
    ///
    /// # Errors
    ///
    /// Returns the builder's configuration errors, or
    /// `CacheError::Configuration` when the runtime cannot start.
    pub fn build(builder: HybridCacheBuilder) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("heytom-cache")
            .enable_all()
            .build()
            .map_err(|e| CacheError::configuration(format!("failed to start runtime: {e}")))?;
        let inner = runtime.block_on(builder.build())?;
        Ok(Self { runtime, inner })
    }

    /// See [`HybridCache::get`](AsyncHybridCache::get).
    pub fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>> {
        self.runtime.block_on(self.inner.get(key))
    }

    /// See [`HybridCache::set`](AsyncHybridCache::set).
    pub fn set(&self, key: &str, value: Vec<u8>, expiration: Expiration) -> Result<()> {
        self.runtime.block_on(self.inner.set(key, value, expiration))
    }

    /// See [`HybridCache::remove`](AsyncHybridCache::remove).
    pub fn remove(&self, key: &str) -> Result<()> {
        self.runtime.block_on(self.inner.remove(key))
    }

    /// See [`HybridCache::refresh`](AsyncHybridCache::refresh).
    pub fn refresh(&self, key: &str) -> Result<()> {
        self.runtime.block_on(self.inner.refresh(key))
    }

    /// See [`HybridCache::hash_set`](AsyncHybridCache::hash_set).
    pub fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.runtime.block_on(self.inner.hash_set(key, field, value))
    }

    /// See [`HybridCache::hash_get`](AsyncHybridCache::hash_get).
    pub fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.runtime.block_on(self.inner.hash_get(key, field))
    }

    /// See [`HybridCache::hash_get_all`](AsyncHybridCache::hash_get_all).
    pub fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.runtime.block_on(self.inner.hash_get_all(key))
    }

    /// See [`HybridCache::hash_delete`](AsyncHybridCache::hash_delete).
    pub fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.runtime.block_on(self.inner.hash_delete(key, field))
    }

    /// See [`HybridCache::list_push`](AsyncHybridCache::list_push).
    pub fn list_push(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.runtime.block_on(self.inner.list_push(key, value))
    }

    /// See [`HybridCache::list_pop`](AsyncHybridCache::list_pop).
    pub fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.runtime.block_on(self.inner.list_pop(key))
    }

    /// See [`HybridCache::list_len`](AsyncHybridCache::list_len).
    pub fn list_len(&self, key: &str) -> Result<u64> {
        self.runtime.block_on(self.inner.list_len(key))
    }

    /// See [`HybridCache::set_add`](AsyncHybridCache::set_add).
    pub fn set_add(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.runtime.block_on(self.inner.set_add(key, member))
    }

    /// See [`HybridCache::set_remove`](AsyncHybridCache::set_remove).
    pub fn set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.runtime.block_on(self.inner.set_remove(key, member))
    }

    /// See [`HybridCache::set_members`](AsyncHybridCache::set_members).
    pub fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.runtime.block_on(self.inner.set_members(key))
    }

    /// See [`HybridCache::sorted_add`](AsyncHybridCache::sorted_add).
    pub fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        self.runtime
            .block_on(self.inner.sorted_add(key, member, score))
    }

    /// See
    /// [`HybridCache::sorted_range_by_score`](AsyncHybridCache::sorted_range_by_score).
    pub fn sorted_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<Vec<u8>>> {
        self.runtime
            .block_on(self.inner.sorted_range_by_score(key, min, max))
    }

    /// See [`HybridCache::publish`](AsyncHybridCache::publish).
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.runtime.block_on(self.inner.publish(channel, payload))
    }

    /// See [`HybridCache::subscribe`](AsyncHybridCache::subscribe). The
    /// handler runs on this facade's private runtime.
    pub fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        self.runtime.block_on(self.inner.subscribe(channel, handler))
    }

    /// See [`HybridCache::metrics`](AsyncHybridCache::metrics).
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }

    /// See [`HybridCache::reset_metrics`](AsyncHybridCache::reset_metrics).
    pub fn reset_metrics(&self) {
        self.inner.reset_metrics()
    }

    /// See [`HybridCache::is_near_enabled`](AsyncHybridCache::is_near_enabled).
    #[must_use]
    pub fn is_near_enabled(&self) -> bool {
        self.inner.is_near_enabled()
    }

    /// See [`HybridCache::close`](AsyncHybridCache::close).
    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.inner.close())
    }

    /// The shared async coordinator, for lock handles and mixed use.
    #[must_use]
    pub fn as_async(&self) -> &AsyncHybridCache {
        &self.inner
    }

    /// Block the current thread for `duration` while the runtime keeps
    /// driving background work.
    pub fn sleep(&self, duration: Duration) {
        self.runtime.block_on(async { tokio::time::sleep(duration).await });
    }
}

impl std::fmt::Debug for HybridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("blocking::HybridCache")
            .field("inner", &self.inner)
            .finish()
    }
}
