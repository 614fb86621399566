//! Error types for the cache tiers
//!
//! Provides unified error handling using thiserror. Only foreground,
//! synchronous fetches surface errors; background work logs and swallows them.

use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache tiers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The caller-supplied fetch callback failed
    #[error("Fetch failed: {0:#}")]
    Fetch(#[source] anyhow::Error),

    /// A synchronous fetch did not complete in time
    #[error("Fetch for cache '{cache}' timed out after {timeout:?}")]
    FetchTimeout { cache: String, timeout: Duration },

    /// A configuration value could not be accepted
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Returns true if the error came from the fetch callback itself.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, CacheError::Fetch(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
