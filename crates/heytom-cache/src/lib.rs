//! Two-tier (near/far) distributed cache coordinator.
//!
//! Multiple application instances share a remote far tier (a
//! Redis-compatible server behind the [`far::FarStore`] trait); each
//! instance fronts it with a private in-process near tier and keeps the
//! near tiers approximately coherent by broadcasting invalidation events.
//!
//! ## Architecture
//!
//! ```text
//! GET request → near tier (LRU, per-instance) → far tier (shared) → source
//!                     ↑                              │
//!                     └──── write-through on hit ────┘
//!
//! SET: far tier first (resilience pipeline) → near tier → invalidation event
//! ```
//!
//! ## Graceful degradation
//!
//! Far-tier calls run through a retry + circuit-breaker pipeline. When the
//! far tier stays unavailable and the near tier is enabled, reads serve
//! potentially stale near entries and writes land in the near tier only;
//! without a near tier the operation fails with
//! [`CacheError::Unavailable`].
//!
//! The design is explicitly eventually consistent: a near entry reflects
//! the last value its own process observed, and converges after
//! invalidation delivery or entry expiry.

pub mod blocking;
pub mod cache;
pub mod config;
pub mod error;
pub mod expiration;
pub mod far;
pub mod invalidation;
pub mod metrics;
pub mod mutex;
pub mod near;
pub mod resilience;
pub mod typed;

pub use cache::{HybridCache, HybridCacheBuilder};
pub use config::{CacheConfig, DEFAULT_INVALIDATION_CHANNEL};
pub use error::{CacheError, ErrorCategory, Result};
pub use expiration::{Effective, Expiration};
pub use far::{FarStore, MemoryFarStore, MessageHandler, Subscription, sliding_metadata_key};
pub use invalidation::{
    InvalidationEvent, InvalidationHandler, InvalidationKind, InvalidationPublisher,
    InvalidationSubscriber, StoreInvalidator,
};
pub use metrics::{CacheMetrics, HitTier, MetricsSnapshot};
pub use mutex::{FarMutex, LOCK_KEY_PREFIX};
pub use near::{EvictionCallback, EvictionReason, NearCache};
pub use resilience::{BreakerConfig, BreakerState, ResiliencePipeline, RetryPolicy};
pub use typed::{JsonSerializer, Serializer, TypedCache};
