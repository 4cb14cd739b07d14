//! The far-tier abstraction consumed by the coordinator.
//!
//! This module defines the contract every far-tier backend must implement:
//! byte-level K/V with TTL, the data-structure operations, pub/sub, and the
//! atomic primitives backing the distributed mutex. Implementations must be
//! thread-safe (`Send + Sync`) and object-safe.

mod memory;

pub use memory::MemoryFarStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Callback invoked with the raw payload of each message received on a
/// subscribed channel. Runs on a transport-provided worker; it must be
/// re-entrancy-safe and must not block.
pub type MessageHandler = std::sync::Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Suffix joining a primary key to its sliding-duration sibling.
const SLIDING_METADATA_SUFFIX: &str = ":metadata:sliding";

/// The metadata key holding a primary key's sliding duration (decimal
/// seconds), stored with the same TTL as the primary entry.
#[must_use]
pub fn sliding_metadata_key(key: &str) -> String {
    format!("{key}{SLIDING_METADATA_SUFFIX}")
}

/// A remote shared key/value store with TTL support.
///
/// # Example
///
/// ```ignore
/// use heytom_cache::far::FarStore;
///
/// async fn read(store: &dyn FarStore, key: &str) -> heytom_cache::Result<Option<Vec<u8>>> {
///     store.get(key).await
/// }
/// ```
#[async_trait]
pub trait FarStore: Send + Sync {
    // ==================== Key/Value ====================

    /// Reads the value stored at `key`.
    ///
    /// Returns `None` if the key does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing
    /// keys.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` at `key`, with a server-side TTL when provided.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Removes every listed key in one round trip, returning how many
    /// existed. Multi-key removal is atomic: either all listed keys are
    /// gone afterwards or the call failed.
    async fn remove(&self, keys: &[&str]) -> Result<u64>;

    /// Resets the TTL of `key`. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // ==================== Hash ====================

    /// Sets `field` of the hash at `key`.
    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;

    /// Reads `field` of the hash at `key`.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Reads every field of the hash at `key`.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Deletes `field` from the hash at `key`. Returns `false` when the
    /// field was absent.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    // ==================== List (FIFO) ====================

    /// Appends `value` to the tail of the list at `key`, returning the new
    /// length. Combined with [`list_pop`](Self::list_pop) this yields FIFO
    /// order.
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Removes and returns the head of the list at `key`.
    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Length of the list at `key` (0 when absent).
    async fn list_len(&self, key: &str) -> Result<u64>;

    // ==================== Set ====================

    /// Adds `member` to the set at `key`. Idempotent; returns `false` when
    /// the member was already present.
    async fn set_add(&self, key: &str, member: &[u8]) -> Result<bool>;

    /// Removes `member` from the set at `key`. Returns `false` when the
    /// member was absent.
    async fn set_remove(&self, key: &str, member: &[u8]) -> Result<bool>;

    /// Every member of the set at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    // ==================== Sorted set ====================

    /// Adds `member` with `score` to the sorted set at `key`, overwriting
    /// the score of an existing member. Returns `true` when the member was
    /// newly added.
    async fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool>;

    /// Members whose score lies in `[min, max]`, in ascending score order.
    async fn sorted_range_by_score(&self, key: &str, min: f64, max: f64)
    -> Result<Vec<Vec<u8>>>;

    // ==================== Pub/Sub ====================

    /// Publishes `payload` on `channel`, returning the number of
    /// subscribers that received it. Messages published while no
    /// subscriber is attached are lost.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64>;

    /// Subscribes `handler` to `channel`. Every subscriber on the channel
    /// receives every message (fan-out). The returned handle owns the
    /// consumer; dropping or closing it tears the subscription down.
    async fn subscribe(&self, channel: &str, handler: MessageHandler)
    -> Result<Box<dyn Subscription>>;

    // ==================== Atomic primitives ====================

    /// Stores `value` at `key` with `ttl` only when the key is absent.
    /// Returns whether the set occurred. This is the mutex acquire
    /// primitive.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically deletes `key` when its current value equals `expected`.
    /// Returns whether a deletion occurred. Backends that cannot express
    /// this server-side atomically must not implement it as read-then-
    /// delete.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Atomically resets the TTL of `key` when its current value equals
    /// `expected`. Returns whether the TTL was reset.
    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration)
    -> Result<bool>;

    // ==================== Lifecycle ====================

    /// Round-trips to the backend to verify liveness.
    async fn ping(&self) -> Result<()>;

    /// Releases backend resources. Subsequent operations fail.
    async fn close(&self) -> Result<()>;

    /// Name of this backend for logging and metric tags.
    fn backend_name(&self) -> &'static str;
}

/// Handle owning an active channel subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stops the consumer and releases its transport resources.
    /// Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Whether the consumer is still attached.
    fn is_active(&self) -> bool;
}
