//! Server error types.

use cinnabar_engine::EngineError;
use cinnabar_repl::ReplError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server startup and operation.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Engine error (snapshot initialization at startup).
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Replication error.
    #[error("replication error: {0}")]
    Replication(#[from] ReplError),
}
