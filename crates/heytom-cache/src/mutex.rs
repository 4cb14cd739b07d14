//! Named advisory lock backed by the far store's atomic primitives.
//!
//! Acquire is a `SET if-absent` with TTL; release and extend are
//! server-side compare-and-act operations keyed on the handle's unique
//! token. A naive get-then-delete release would race a concurrent
//! takeover and is deliberately impossible through this API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::far::FarStore;

/// Prefix applied to every lock key.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// A handle on a named distributed lock.
///
/// Each handle owns a freshly generated token; the token is the proof of
/// ownership used by release and extend. Acquiring an already-held handle
/// is a no-op returning success. Release and extend return `false` when
/// the handle does not hold the lock or the far-tier entry no longer
/// carries this handle's token (the lock expired or was taken over).
pub struct FarMutex {
    far: Arc<dyn FarStore>,
    key: String,
    token: String,
    held: AtomicBool,
}

impl FarMutex {
    /// Create a handle for `resource`. No far-tier call is made until
    /// [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidKey` when `resource` is empty or
    /// whitespace.
    pub fn new(far: Arc<dyn FarStore>, resource: &str) -> Result<Self> {
        if resource.trim().is_empty() {
            return Err(CacheError::invalid_key(
                "lock resource must be non-empty and non-whitespace",
            ));
        }
        Ok(Self {
            far,
            key: format!("{LOCK_KEY_PREFIX}{resource}"),
            token: Uuid::new_v4().to_string(),
            held: AtomicBool::new(false),
        })
    }

    /// The far-tier key guarding the resource.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this handle believes it holds the lock. The far tier may
    /// have expired the entry since; extend discovers that.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Try to take the lock once. Returns `true` on success and when the
    /// handle already holds the lock.
    pub async fn acquire(&self, ttl: Duration) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let acquired = self
            .far
            .set_if_absent(&self.key, self.token.as_bytes(), ttl)
            .await?;
        if acquired {
            self.held.store(true, Ordering::Release);
            tracing::debug!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        }
        Ok(acquired)
    }

    /// Try to take the lock, retrying every `retry_interval` until
    /// success or `wait` elapses. Dropping the returned future aborts the
    /// wait at the next sleep.
    pub async fn acquire_within(
        &self,
        ttl: Duration,
        wait: Duration,
        retry_interval: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.acquire(ttl).await? {
                return Ok(true);
            }
            if Instant::now() + retry_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(retry_interval).await;
        }
    }

    /// Release the lock. Returns `false` when the handle does not hold it
    /// locally or the far-tier entry no longer carries this token.
    pub async fn release(&self) -> Result<bool> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let released = self
            .far
            .compare_and_delete(&self.key, self.token.as_bytes())
            .await?;
        if released {
            tracing::debug!(key = %self.key, "lock released");
        } else {
            tracing::warn!(key = %self.key, "lock was no longer owned at release");
        }
        Ok(released)
    }

    /// Push the lock's TTL out to `ttl` from now. Returns `false` (and
    /// marks the handle not held) when ownership was lost.
    pub async fn extend(&self, ttl: Duration) -> Result<bool> {
        if !self.is_held() {
            return Ok(false);
        }
        let extended = self
            .far
            .compare_and_expire(&self.key, self.token.as_bytes(), ttl)
            .await?;
        if !extended {
            self.held.store(false, Ordering::Release);
            tracing::warn!(key = %self.key, "lock ownership lost before extend");
        }
        Ok(extended)
    }

    /// Release the lock if held, logging rather than surfacing errors.
    /// Called by `Drop` on a best-effort basis; prefer calling this
    /// explicitly.
    pub async fn dispose(&self) {
        if !self.is_held() {
            return;
        }
        if let Err(e) = self.release().await {
            tracing::warn!(key = %self.key, error = %e, "failed to release lock at disposal");
        }
    }
}

impl Drop for FarMutex {
    fn drop(&mut self) {
        if !self.held.load(Ordering::Acquire) {
            return;
        }
        // Drop is synchronous; hand the release to the runtime when one
        // is available, otherwise the TTL reclaims the lock.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let far = Arc::clone(&self.far);
                let key = std::mem::take(&mut self.key);
                let token = std::mem::take(&mut self.token);
                handle.spawn(async move {
                    if let Err(e) = far.compare_and_delete(&key, token.as_bytes()).await {
                        tracing::warn!(key = %key, error = %e, "failed to release lock on drop");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = %self.key,
                    "lock handle dropped while held outside a runtime; TTL will reclaim it"
                );
            }
        }
    }
}

impl std::fmt::Debug for FarMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarMutex")
            .field("key", &self.key)
            .field("held", &self.is_held())
            .finish()
    }
}
