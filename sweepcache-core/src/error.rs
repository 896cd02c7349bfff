//! Error types for the cache.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by cache construction, policy validation and timer control.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The expiration timer was enabled outside of a Tokio runtime
    #[error("Expiration timer requires a Tokio runtime")]
    NoRuntime,

    /// A policy set both an absolute and a sliding expiration
    #[error("Absolute and sliding expiration cannot both be set")]
    ConflictingExpiration,

    /// A sliding expiration longer than one year was requested
    #[error("Sliding expiration {0:?} exceeds the maximum of 365 days")]
    SlidingExpirationOutOfRange(Duration),

    /// A configuration value is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Returns `true` if this error comes from a rejected item policy.
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            CacheError::ConflictingExpiration | CacheError::SlidingExpirationOutOfRange(_)
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;
