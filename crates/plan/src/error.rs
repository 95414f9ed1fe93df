//! Error types for plan loading and validation.

use thiserror::Error;

/// Result type for plan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading the plan document.
#[derive(Debug, Error)]
pub enum Error {
    /// The document is not valid YAML or does not match the schema.
    #[error("plan parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but violates a plan invariant.
    #[error("plan validation error: {reason}")]
    Validation { reason: String },

    /// I/O error reading the document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}
