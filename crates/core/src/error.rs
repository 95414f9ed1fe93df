//! Error taxonomy shared by the gateway and the reconciler.
//!
//! Every remote failure is classified into one of four classes that drive
//! retry and propagation policy: rate-limit (retry after a server-dictated
//! delay), transient (retry with backoff), not-found (converted to an
//! optional result at lookup sites), and fatal (propagate immediately).

use thiserror::Error;

/// Result type for concierge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Server asked us to slow down; retry after its delay.
    RateLimited,
    /// Unknown or transport-level failure; retry with backoff.
    Transient,
    /// The resource does not exist. Expected-absence, never retried.
    NotFound,
    /// Everything else. Propagates uncaught.
    Fatal,
}

/// Errors that can occur while converging remote state.
#[derive(Debug, Error)]
pub enum Error {
    /// Server-side throttle. Carries the retry delay if the server sent one.
    #[error("rate limited by server (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// A failure worth retrying with backoff.
    #[error("transient remote failure: {reason}")]
    Transient { reason: String },

    /// The requested resource does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Remote state violates an invariant the reconciler relies on.
    /// Aborts the current pass; the next periodic pass retries wholesale.
    #[error("remote state assertion failed: {reason}")]
    Assertion { reason: String },

    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A non-retryable remote API rejection (auth failure, bad request).
    #[error("remote API error {status} ({code:?}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// HTTP transport error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a rate-limited error with an optional server-supplied delay.
    pub const fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited { retry_after_ms }
    }

    /// Create a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an assertion error.
    pub fn assertion(reason: impl Into<String>) -> Self {
        Self::Assertion {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a remote API rejection.
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code,
            message: message.into(),
        }
    }

    /// Classify this error for retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Http(e) if e.is_connect() || e.is_timeout() => ErrorClass::Transient,
            Self::NotFound { .. } => ErrorClass::NotFound,
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::RateLimited | ErrorClass::Transient
        )
    }

    /// Server-dictated retry delay in milliseconds, if any.
    pub const fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Convert a not-found error into `None`, propagating everything else.
///
/// Lookup call sites that search for possibly-absent resources use this so
/// absence never travels as an error.
pub fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.class() == ErrorClass::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn rate_limited_is_retryable_and_carries_delay() {
        let e = Error::rate_limited(Some(5_000));
        assert!(e.is_retryable());
        assert_eq!(e.class(), ErrorClass::RateLimited);
        assert_eq!(e.retry_after_ms(), Some(5_000));
    }

    #[test]
    fn transient_is_retryable_without_delay() {
        let e = Error::transient("connection reset");
        assert!(e.is_retryable());
        assert_eq!(e.retry_after_ms(), None);
    }

    #[test]
    fn assertion_is_fatal() {
        let e = Error::assertion("room has no power levels event");
        assert!(!e.is_retryable());
        assert_eq!(e.class(), ErrorClass::Fatal);
    }

    #[test]
    fn optional_converts_not_found() {
        let hit: Result<u32> = Ok(7);
        let miss: Result<u32> = Err(Error::not_found("#alias"));
        let fatal: Result<u32> = Err(Error::assertion("boom"));

        assert_eq!(optional(hit).unwrap(), Some(7));
        assert_eq!(optional(miss).unwrap(), None);
        assert!(optional(fatal).is_err());
    }
}
