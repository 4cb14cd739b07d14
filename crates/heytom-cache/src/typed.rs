//! Typed helpers over the byte-oriented coordinator.
//!
//! The core trades in bytes; this layer adds a serializer seam and a
//! read-through compute helper without widening the coordinator itself.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::HybridCache;
use crate::error::{CacheError, Result};
use crate::expiration::Expiration;

/// Encodes and decodes typed values for cache storage.
pub trait Serializer: Send + Sync {
    /// Encode `value` into bytes.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Serialization` when encoding fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode `bytes` into a value.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Serialization` when the bytes do not decode
    /// into `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}

/// Typed view over a [`HybridCache`].
#[derive(Clone)]
pub struct TypedCache<S = JsonSerializer> {
    cache: HybridCache,
    serializer: S,
}

impl TypedCache<JsonSerializer> {
    /// Wrap `cache` with JSON serialization.
    #[must_use]
    pub fn json(cache: HybridCache) -> Self {
        Self::new(cache, JsonSerializer)
    }
}

impl<S: Serializer> TypedCache<S> {
    /// Wrap `cache` with the given serializer.
    #[must_use]
    pub fn new(cache: HybridCache, serializer: S) -> Self {
        Self { cache, serializer }
    }

    /// The underlying byte-oriented cache.
    #[must_use]
    pub fn raw(&self) -> &HybridCache {
        &self.cache
    }

    /// Look up and decode `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.cache.get(key).await? {
            Some(bytes) => Ok(Some(self.serializer.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and store `value` at `key`.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> Result<()> {
        let bytes = self.serializer.encode(value)?;
        self.cache.set(key, bytes, expiration).await
    }

    /// Remove `key` from both tiers.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.cache.remove(key).await
    }

    /// Look up `key`; on a miss, run `factory`, store its result with
    /// `expiration`, and return it.
    pub async fn get_or_insert_with<T, F, Fut>(
        &self,
        key: &str,
        expiration: Expiration,
        factory: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(found) = self.get(key).await? {
            return Ok(found);
        }
        let computed = factory().await?;
        self.set(key, &computed, expiration).await?;
        Ok(computed)
    }
}

impl<S> std::fmt::Debug for TypedCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache").field("cache", &self.cache).finish()
    }
}
