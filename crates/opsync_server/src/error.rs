//! Error types for the sync server.

use opsync_core::OplogError;
use opsync_protocol::{CodecError, ErrorKind, ErrorResponse};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request carried no usable credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The credentials were rejected.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The operation log refused the call.
    #[error(transparent)]
    Oplog(#[from] OplogError),

    /// The request envelope could not be decoded or encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The request did not finish within the server's timeout.
    #[error("request timed out")]
    Timeout,

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        match self {
            ServerError::InvalidRequest(_)
            | ServerError::AuthenticationFailed(_)
            | ServerError::NotAuthorized(_)
            | ServerError::Codec(_) => true,
            ServerError::Oplog(err) => {
                err.is_client_error() || matches!(err, OplogError::Cancelled)
            }
            _ => false,
        }
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Oplog(err) => err.is_retryable(),
            ServerError::Timeout | ServerError::ShuttingDown | ServerError::Io(_) => true,
            _ => false,
        }
    }

    /// Returns the coarse classification sent to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => ErrorKind::InvalidArgument,
            ServerError::AuthenticationFailed(_) | ServerError::NotAuthorized(_) => {
                ErrorKind::Unauthorized
            }
            ServerError::Oplog(err) => match err {
                OplogError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                OplogError::StorageUnavailable(_) | OplogError::Conflict(_) => {
                    ErrorKind::Unavailable
                }
                OplogError::Timeout | OplogError::Cancelled => ErrorKind::Timeout,
                _ => ErrorKind::Internal,
            },
            ServerError::Timeout => ErrorKind::Timeout,
            ServerError::ShuttingDown | ServerError::Io(_) => ErrorKind::Unavailable,
            ServerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Converts the error into the response sent back to the device.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.kind(), self.to_string(), self.is_retryable())
    }
}
