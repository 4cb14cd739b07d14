//! Error types for cache operations.
//!
//! The taxonomy distinguishes caller mistakes (invalid keys, disposed
//! handles), transient far-tier failures that the resilience pipeline may
//! still absorb, and terminal outcomes (`CircuitOpen`, `Unavailable`).

use std::fmt;
use std::sync::Arc;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The key is empty or whitespace-only.
    #[error("Invalid cache key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// The value violates an input constraint.
    #[error("Invalid cache value: {reason}")]
    InvalidValue {
        /// Why the value was rejected.
        reason: String,
    },

    /// The expiration options are contradictory or already elapsed.
    #[error("Invalid expiration: {reason}")]
    InvalidExpiration {
        /// Why the expiration was rejected.
        reason: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Description of the configuration problem.
        reason: String,
    },

    /// The cache was used after `close()`.
    #[error("Cache has been disposed")]
    Disposed,

    /// A far-tier operation exceeded the configured timeout.
    #[error("Far-tier operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the operation ran before the deadline fired.
        elapsed_ms: u64,
    },

    /// The far-tier connection failed or was refused.
    #[error("Far-tier connection error: {message}")]
    Connection {
        /// Transport-level failure description.
        message: String,
    },

    /// The far tier returned an error response.
    #[error("Far-tier backend error: {message}")]
    Backend {
        /// Backend failure description.
        message: String,
    },

    /// The circuit breaker is open; the operation was not attempted.
    #[error("Circuit breaker is open; far tier calls are short-circuited")]
    CircuitOpen,

    /// The far tier is unavailable and no near-tier degradation applies.
    #[error("Far tier unavailable: {source}")]
    Unavailable {
        /// The failure that exhausted the pipeline.
        #[source]
        source: Arc<CacheError>,
    },

    /// The operation was canceled before completion.
    #[error("Operation canceled")]
    Canceled,

    /// A typed value failed to encode or decode.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Encoder/decoder failure description.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidExpiration` error.
    #[must_use]
    pub fn invalid_expiration(reason: impl Into<String>) -> Self {
        Self::InvalidExpiration {
            reason: reason.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Wraps a pipeline failure as the terminal `Unavailable` outcome.
    #[must_use]
    pub fn unavailable(source: CacheError) -> Self {
        Self::Unavailable {
            source: Arc::new(source),
        }
    }

    /// Returns `true` for the classified transient set: connection,
    /// backend, and timeout failures. Only these enter the retry and
    /// circuit-breaker pipeline.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::Backend { .. }
        )
    }

    /// Returns `true` if the error is a terminal far-tier outcome that the
    /// coordinator's degradation clauses must handle.
    #[must_use]
    pub fn is_degradable(&self) -> bool {
        self.is_transient() || matches!(self, Self::CircuitOpen | Self::Unavailable { .. })
    }

    /// Returns the error category for logging and monitoring.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey { .. } | Self::InvalidValue { .. } | Self::InvalidExpiration { .. } => {
                ErrorCategory::Validation
            }
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Disposed => ErrorCategory::Lifecycle,
            Self::Timeout { .. } | Self::Connection { .. } | Self::Backend { .. } => {
                ErrorCategory::Transient
            }
            Self::CircuitOpen | Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Canceled => ErrorCategory::Canceled,
            Self::Serialization { .. } => ErrorCategory::Serialization,
        }
    }
}

/// Categories of cache errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Input validation failure.
    Validation,
    /// Invalid configuration.
    Configuration,
    /// Use after disposal.
    Lifecycle,
    /// Retryable far-tier failure.
    Transient,
    /// Far tier unavailable (pipeline exhausted or circuit open).
    Unavailable,
    /// Operation canceled.
    Canceled,
    /// Typed encode/decode failure.
    Serialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Transient => write!(f, "transient"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Canceled => write!(f, "canceled"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

/// Convenience result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::invalid_key("key must not be empty");
        assert_eq!(err.to_string(), "Invalid cache key: key must not be empty");

        let err = CacheError::Timeout { elapsed_ms: 5000 };
        assert_eq!(
            err.to_string(),
            "Far-tier operation timed out after 5000ms"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::connection("refused").is_transient());
        assert!(CacheError::backend("LOADING").is_transient());
        assert!(CacheError::Timeout { elapsed_ms: 1 }.is_transient());

        assert!(!CacheError::invalid_key("empty").is_transient());
        assert!(!CacheError::Disposed.is_transient());
        assert!(!CacheError::CircuitOpen.is_transient());
        assert!(!CacheError::Canceled.is_transient());
    }

    #[test]
    fn test_degradable_classification() {
        assert!(CacheError::CircuitOpen.is_degradable());
        assert!(CacheError::unavailable(CacheError::connection("down")).is_degradable());
        assert!(CacheError::connection("down").is_degradable());
        assert!(!CacheError::invalid_key("empty").is_degradable());
    }

    #[test]
    fn test_unavailable_preserves_source() {
        let err = CacheError::unavailable(CacheError::Timeout { elapsed_ms: 5000 });
        assert!(err.to_string().contains("timed out"));
        assert_eq!(err.category(), ErrorCategory::Unavailable);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            CacheError::invalid_value("null").category(),
            ErrorCategory::Validation
        );
        assert_eq!(CacheError::Disposed.category(), ErrorCategory::Lifecycle);
        assert_eq!(
            CacheError::backend("oops").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            CacheError::serialization("bad json").category(),
            ErrorCategory::Serialization
        );
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Unavailable.to_string(), "unavailable");
    }
}
