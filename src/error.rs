//! Error kinds for the cache engine.
//!
//! Mirrors `spec.md` §7: `NotFound` and `BudgetExceeded` are never surfaced through
//! this type (they're outcomes, not errors — see [`crate::common::Outcome`]); everything
//! else that can legitimately fail a caller-facing operation has a variant here.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("producer failed: {0}")]
    ProducerFailed(String),

    #[error("producer timed out after {0:?}")]
    ProducerTimeout(std::time::Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<regex::Error> for CacheError {
    fn from(e: regex::Error) -> Self {
        CacheError::Configuration(format!("invalid pattern: {e}"))
    }
}
