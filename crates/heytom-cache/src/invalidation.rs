//! Cross-instance invalidation events and their fan-out transport.
//!
//! When an instance writes or removes a key it broadcasts an
//! [`InvalidationEvent`]; peers drop the key from their near tier only and
//! never re-publish, so events cannot loop. Delivery is best-effort: a
//! lost message degrades staleness, not correctness, because entry TTLs
//! still bound the staleness window and writes reach the authoritative far
//! tier first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CacheError, Result};
use crate::far::{FarStore, Subscription};

/// What happened to the key at the emitting instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationKind {
    /// The key was written with a new value.
    Update,
    /// The key was explicitly removed.
    Remove,
    /// The key expired.
    Expire,
}

impl InvalidationKind {
    /// Returns the wire representation of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationKind::Update => "Update",
            InvalidationKind::Remove => "Remove",
            InvalidationKind::Expire => "Expire",
        }
    }
}

impl std::fmt::Display for InvalidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A broadcast instruction to drop `key` from peer near tiers.
///
/// Serialized as JSON for transport; consumers tolerate unknown fields and
/// a missing `Source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// The affected cache key.
    #[serde(rename = "Key")]
    pub key: String,
    /// What happened to the key.
    #[serde(rename = "Type")]
    pub kind: InvalidationKind,
    /// When the emitting instance observed the change.
    #[serde(rename = "Timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Emitting instance, when known.
    #[serde(rename = "Source", default)]
    pub source: Option<String>,
}

impl InvalidationEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: InvalidationKind, key: impl Into<String>, source: Option<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            timestamp: OffsetDateTime::now_utc(),
            source,
        }
    }

    /// Create an `Update` event.
    #[must_use]
    pub fn update(key: impl Into<String>, source: Option<String>) -> Self {
        Self::new(InvalidationKind::Update, key, source)
    }

    /// Create a `Remove` event.
    #[must_use]
    pub fn remove(key: impl Into<String>, source: Option<String>) -> Self {
        Self::new(InvalidationKind::Remove, key, source)
    }

    /// Create an `Expire` event.
    #[must_use]
    pub fn expire(key: impl Into<String>, source: Option<String>) -> Self {
        Self::new(InvalidationKind::Expire, key, source)
    }
}

/// Callback invoked with each received invalidation event.
pub type InvalidationHandler = Arc<dyn Fn(InvalidationEvent) + Send + Sync>;

/// Emits invalidation events to peers.
#[async_trait]
pub trait InvalidationPublisher: Send + Sync {
    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns a transport error; callers on the coordinator's write path
    /// log and swallow it.
    async fn publish(&self, event: &InvalidationEvent) -> Result<()>;

    /// Publish a batch, returning how many events were accepted by the
    /// transport.
    async fn publish_batch(&self, events: &[InvalidationEvent]) -> Result<usize>;
}

/// Consumes invalidation events from peers.
#[async_trait]
pub trait InvalidationSubscriber: Send + Sync {
    /// Install `handler` and start consuming. Replaces any previous
    /// subscription.
    async fn subscribe(&self, handler: InvalidationHandler) -> Result<()>;

    /// Stop consuming and release transport resources. Idempotent.
    async fn unsubscribe(&self) -> Result<()>;

    /// Whether a consumer is currently attached.
    fn is_subscribed(&self) -> bool;
}

/// The on-store transport: invalidation fan-out over the far store's own
/// pub/sub. Every subscriber on the channel sees every message; messages
/// published while no subscriber is attached are lost, which the design
/// tolerates.
pub struct StoreInvalidator {
    far: Arc<dyn FarStore>,
    channel: String,
    /// Serializes (re)establishment of the subscription.
    subscription: tokio::sync::Mutex<Option<Box<dyn Subscription>>>,
    subscribed: AtomicBool,
}

impl StoreInvalidator {
    /// Create a transport bound to `channel` on `far`.
    #[must_use]
    pub fn new(far: Arc<dyn FarStore>, channel: impl Into<String>) -> Self {
        Self {
            far,
            channel: channel.into(),
            subscription: tokio::sync::Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }
    }

    /// The channel this transport publishes and consumes on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl InvalidationPublisher for StoreInvalidator {
    async fn publish(&self, event: &InvalidationEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| CacheError::serialization(e.to_string()))?;
        self.far.publish(&self.channel, &payload).await?;
        tracing::debug!(key = %event.key, kind = %event.kind, "published invalidation");
        Ok(())
    }

    async fn publish_batch(&self, events: &[InvalidationEvent]) -> Result<usize> {
        let mut accepted = 0;
        for event in events {
            match self.publish(event).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(key = %event.key, error = %e, "failed to publish invalidation")
                }
            }
        }
        Ok(accepted)
    }
}

#[async_trait]
impl InvalidationSubscriber for StoreInvalidator {
    async fn subscribe(&self, handler: InvalidationHandler) -> Result<()> {
        let mut guard = self.subscription.lock().await;
        if let Some(mut old) = guard.take() {
            old.close().await.ok();
        }

        let raw_handler: crate::far::MessageHandler = Arc::new(move |payload: Vec<u8>| {
            match serde_json::from_slice::<InvalidationEvent>(&payload) {
                Ok(event) if event.key.is_empty() => {
                    tracing::warn!("dropping invalidation event with empty key");
                }
                Ok(event) => handler(event),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to deserialize invalidation event");
                }
            }
        });

        let subscription = self.far.subscribe(&self.channel, raw_handler).await?;
        *guard = Some(subscription);
        self.subscribed.store(true, Ordering::Release);
        tracing::info!(channel = %self.channel, "subscribed to invalidation channel");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut guard = self.subscription.lock().await;
        if let Some(mut subscription) = guard.take() {
            subscription.close().await?;
        }
        self.subscribed.store(false, Ordering::Release);
        Ok(())
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }
}
