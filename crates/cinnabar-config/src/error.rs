//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or merging configuration sources.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named configuration file is missing or does not
    /// parse.
    #[error("invalid configuration file {path}: {reason}")]
    InvalidFile { path: String, reason: String },

    /// Merging sources failed.
    #[error("configuration merge failed: {0}")]
    Merge(#[from] config::ConfigError),

    /// I/O while probing configuration paths.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
