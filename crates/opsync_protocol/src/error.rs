//! Codec error types.

use thiserror::Error;

/// Result type for encoding and decoding.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding CBOR.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Input bytes are not a valid encoding of the expected type.
    #[error("decode failed: {0}")]
    Decode(String),
}
