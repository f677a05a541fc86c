//! Error types.

use thiserror::Error;

/// Fatal errors of a partitioning run.
///
/// Imbalance is not an error. A median search that misses its tolerance
/// produces an [ImbalanceWarning](crate::bisect::ImbalanceWarning) instead.
#[derive(Error, Debug)]
pub enum RcbError {
    /// A required callback or option is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Application data is inconsistent, locally or across processes.
    #[error("Input error: {0}")]
    Input(String),

    /// A protocol or programming error, e.g. an empty box on a participating group.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A partition tree could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RcbError {
    /// Numeric status code exchanged between ranks. Zero is reserved for success.
    pub fn code(&self) -> usize {
        match self {
            RcbError::Configuration(_) => 1,
            RcbError::Input(_) => 2,
            RcbError::InvariantViolation(_) => 3,
            RcbError::Serialization(_) => 4,
        }
    }

    /// Reconstruct an error reported by another rank from its status code.
    pub fn from_remote(code: usize, rank: usize) -> Self {
        let message = format!("rank {} aborted the partitioning run", rank);
        match code {
            1 => RcbError::Configuration(message),
            2 => RcbError::Input(message),
            _ => RcbError::InvariantViolation(message),
        }
    }
}

/// Result alias used throughout the crate.
pub type RcbResult<T> = Result<T, RcbError>;
