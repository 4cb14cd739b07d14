//! Redis far-tier adapter for `heytom-cache`.
//!
//! One multiplexed deadpool connection pool is shared by every cache
//! operation; channel subscriptions each get a dedicated client
//! connection (pooled connections cannot `SUBSCRIBE`) with automatic
//! reconnection. The mutex primitives use `SET NX PX` and server-side
//! Lua scripts, never read-then-act sequences.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use heytom_cache::{CacheConfig, HybridCache};
//! use heytom_cache_redis::RedisFarStore;
//!
//! let config = CacheConfig::for_url("redis://127.0.0.1:6379");
//! let store = RedisFarStore::connect(&config)?;
//! let cache = HybridCache::builder()
//!     .config(config)
//!     .far_store(Arc::new(store))
//!     .build()
//!     .await?;
//! ```

mod store;

pub use store::{RedisFarStore, RedisFarStoreBuilder};
