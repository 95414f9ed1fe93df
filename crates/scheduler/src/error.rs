//! Error types for the scheduler crate.

use thiserror::Error;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when arming a timer.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested firing time exceeds the maximum representable timer
    /// delay. Long-range work must be re-armed incrementally by the
    /// periodic pass instead.
    #[error("delay of {requested_ms} ms exceeds maximum timer delay of {max_ms} ms")]
    DelayTooLong { requested_ms: i64, max_ms: u64 },
}
