//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to truncate to a size larger than the content.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncateBeyondEnd {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// Content does not fit into addressable memory.
    #[error("storage of {size} bytes is too large to load")]
    TooLarge {
        /// The current storage size.
        size: u64,
    },

    /// Another process holds the journal lock.
    #[error("storage locked by another process: {0}")]
    Locked(String),
}

impl StorageError {
    /// Returns true if the failure is environmental and the call may succeed
    /// when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
            ),
            StorageError::Locked(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = StorageError::from(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(err.is_transient());

        let err = StorageError::from(io::Error::new(io::ErrorKind::InvalidData, "bad"));
        assert!(!err.is_transient());
    }

    #[test]
    fn range_errors_are_not_transient() {
        let err = StorageError::ReadPastEnd {
            offset: 10,
            len: 4,
            size: 12,
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("offset 10"));
    }
}
