//! Error types for nimbus-store

use thiserror::Error;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a block provider
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Error reported by the remote API
    #[error("backend error: {0}")]
    Api(String),

    /// Credential verification failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Stored block has the wrong length
    #[error("block {id} has length {actual}, expected {expected}")]
    BlockLength {
        /// Block id
        id: u64,
        /// Length found in the store
        actual: usize,
        /// Configured block size
        expected: usize,
    },
}
