//! Error types for `cmdpipe` core library.

use thiserror::Error;

/// Result type alias using `cmdpipe` core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `cmdpipe` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed environment assignment
    #[error("Invalid environment entry: {0}")]
    InvalidEnv(String),
}
