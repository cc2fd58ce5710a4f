//! Error types for `warmpool` core library.

use thiserror::Error;

/// Result type alias using `warmpool` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `warmpool` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
