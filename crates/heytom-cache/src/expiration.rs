//! Entry expiration options and deadline math.
//!
//! An [`Expiration`] carries at most three fields: an absolute wall-clock
//! deadline, an absolute-relative duration (resolved to a deadline at store
//! time), and a sliding duration. At most one absolute form is meaningful;
//! when both appear, the wall-clock deadline wins. When absolute and
//! sliding are both set, the effective initial TTL is the smaller of the
//! two, and sliding bumps on later reads never exceed the remaining
//! absolute budget.

use std::time::Duration;

use time::OffsetDateTime;

use crate::error::{CacheError, Result};

/// Expiration options for a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiration {
    absolute_at: Option<OffsetDateTime>,
    absolute_after: Option<Duration>,
    sliding: Option<Duration>,
}

impl Expiration {
    /// No explicit expiration; the cache applies its configured default.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Expire at a fixed wall-clock deadline.
    #[must_use]
    pub fn at(deadline: OffsetDateTime) -> Self {
        Self {
            absolute_at: Some(deadline),
            ..Self::default()
        }
    }

    /// Expire a fixed duration after store time.
    #[must_use]
    pub fn after(ttl: Duration) -> Self {
        Self {
            absolute_after: Some(ttl),
            ..Self::default()
        }
    }

    /// Expire when the entry has not been read for `window`.
    #[must_use]
    pub fn sliding(window: Duration) -> Self {
        Self {
            sliding: Some(window),
            ..Self::default()
        }
    }

    /// Add a sliding window to an absolute expiration.
    #[must_use]
    pub fn with_sliding(mut self, window: Duration) -> Self {
        self.sliding = Some(window);
        self
    }

    /// Returns `true` when no field is set.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.absolute_at.is_none() && self.absolute_after.is_none() && self.sliding.is_none()
    }

    /// The sliding window, if any.
    #[must_use]
    pub fn sliding_window(&self) -> Option<Duration> {
        self.sliding
    }

    /// Resolve the options against `now` into effective store-time values.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidExpiration` when the absolute deadline
    /// is in the past, or when a provided duration is zero.
    pub fn resolve(&self, now: OffsetDateTime) -> Result<Effective> {
        if let Some(window) = self.sliding {
            if window.is_zero() {
                return Err(CacheError::invalid_expiration(
                    "sliding window must be greater than zero",
                ));
            }
        }
        if let Some(ttl) = self.absolute_after {
            if ttl.is_zero() {
                return Err(CacheError::invalid_expiration(
                    "absolute duration must be greater than zero",
                ));
            }
        }

        // The wall-clock deadline wins over the relative form.
        let absolute = match self.absolute_at {
            Some(deadline) => {
                let remaining = deadline - now;
                if remaining.is_negative() || remaining.is_zero() {
                    return Err(CacheError::invalid_expiration(
                        "absolute deadline is in the past",
                    ));
                }
                Some(remaining.unsigned_abs())
            }
            None => self.absolute_after,
        };

        let initial_ttl = match (absolute, self.sliding) {
            (Some(abs), Some(win)) => Some(abs.min(win)),
            (Some(abs), None) => Some(abs),
            (None, Some(win)) => Some(win),
            (None, None) => None,
        };

        Ok(Effective {
            initial_ttl,
            absolute,
            sliding: self.sliding,
        })
    }
}

/// Store-time resolution of an [`Expiration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effective {
    /// The TTL to apply at store time: `min(absolute remaining, sliding)`
    /// when both are present, `None` when the caller should use the
    /// configured default.
    pub initial_ttl: Option<Duration>,
    /// Remaining absolute budget, the hard cap for sliding bumps.
    pub absolute: Option<Duration>,
    /// The sliding window, reset on each successful read.
    pub sliding: Option<Duration>,
}
