//! Error types for the operation log.

use opsync_protocol::CodecError;
use opsync_storage::StorageError;
use thiserror::Error;

/// Result type for operation log calls.
pub type OplogResult<T> = Result<T, OplogError>;

/// Errors that can occur in the operation log.
#[derive(Debug, Error)]
pub enum OplogError {
    /// The persistence backend failed transiently; the caller may retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A batch was rejected because it would violate a log invariant.
    /// Nothing from the batch was applied.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request data, rejected before touching storage.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A journal record failed its checksum.
    #[error(
        "journal checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}"
    )]
    ChecksumMismatch {
        /// Offset of the damaged record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The journal is structurally damaged.
    #[error("journal corrupted: {0}")]
    JournalCorrupted(String),

    /// A journal record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("call deadline exceeded")]
    Timeout,
}

impl OplogError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates an internal error and logs it; internal errors indicate bugs.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "operation log invariant violated");
        Self::Internal(message)
    }

    /// Returns true if the same call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OplogError::StorageUnavailable(_) | OplogError::Timeout)
    }

    /// Returns true if the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, OplogError::InvalidArgument(_))
    }
}

impl From<StorageError> for OplogError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            OplogError::StorageUnavailable(err.to_string())
        } else {
            OplogError::internal(err.to_string())
        }
    }
}
