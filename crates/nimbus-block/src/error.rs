//! Block device error types

use std::io;

use thiserror::Error;

/// Result type for block-layer operations
pub type BlockResult<T> = Result<T, BlockError>;

/// Errors that can occur in the block map and the NBD gateway
#[derive(Debug, Error)]
pub enum BlockError {
    /// I/O error on the NBD socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed NBD protocol traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request range exceeds the device
    #[error("out of bounds: offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds {
        /// Byte offset of the request
        offset: u64,
        /// Byte length of the request
        length: u64,
        /// Device size in bytes
        size: u64,
    },

    /// Device geometry is unusable
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// Error from the storage provider
    #[error("store error: {0}")]
    Store(#[from] nimbus_store::Error),

    /// A spawned data-path worker died
    #[error("worker failed: {0}")]
    Worker(String),
}

impl BlockError {
    /// Map to the errno value reported to the NBD client
    pub fn to_nbd_errno(&self) -> NbdErrno {
        match self {
            BlockError::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => NbdErrno::Perm,
                io::ErrorKind::InvalidInput => NbdErrno::Inval,
                _ => NbdErrno::Io,
            },
            BlockError::OutOfBounds { .. } => NbdErrno::Inval,
            BlockError::Protocol(_) => NbdErrno::Inval,
            BlockError::Geometry(_) => NbdErrno::Inval,
            _ => NbdErrno::Io,
        }
    }
}

/// Errno values carried in NBD replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdErrno {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// I/O error
    Io = 5,
    /// Invalid argument
    Inval = 22,
    /// No space left on device
    NoSpc = 28,
    /// Operation not supported
    NotSup = 95,
    /// Server shutting down
    Shutdown = 108,
}

impl NbdErrno {
    /// Wire value
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Whether this reply signals success
    pub fn is_ok(&self) -> bool {
        matches!(self, NbdErrno::Ok)
    }
}

impl std::fmt::Display for NbdErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbdErrno::Ok => write!(f, "success"),
            NbdErrno::Perm => write!(f, "permission denied"),
            NbdErrno::Io => write!(f, "I/O error"),
            NbdErrno::Inval => write!(f, "invalid argument"),
            NbdErrno::NoSpc => write!(f, "no space left"),
            NbdErrno::NotSup => write!(f, "not supported"),
            NbdErrno::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_errors_map_to_einval() {
        let err = BlockError::OutOfBounds {
            offset: 100,
            length: 50,
            size: 128,
        };
        assert_eq!(err.to_nbd_errno(), NbdErrno::Inval);
    }

    #[test]
    fn store_errors_map_to_eio() {
        let err = BlockError::Store(nimbus_store::Error::Api("down".to_string()));
        assert_eq!(err.to_nbd_errno(), NbdErrno::Io);
        assert!(!err.to_nbd_errno().is_ok());
    }

    #[test]
    fn errno_codes_match_the_wire_protocol() {
        assert_eq!(NbdErrno::Ok.code(), 0);
        assert_eq!(NbdErrno::Io.code(), 5);
        assert_eq!(NbdErrno::Inval.code(), 22);
        assert_eq!(NbdErrno::NotSup.code(), 95);
    }
}
