//! # opsync protocol
//!
//! Data and wire types shared by the opsync engine, server and clients.
//!
//! This crate provides:
//! - Identifier newtypes ([`UserId`], [`DeviceId`], [`OperationId`])
//! - [`Operation`] and [`TrackedEntity`], the immutable log records
//! - [`OrderKey`], the `(created_at, id)` total order of a user's log
//! - Request/response messages and the [`SyncMessage`] envelope
//! - CBOR encoding/decoding via `ciborium`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod codec;
mod error;
mod ids;
mod messages;
mod operation;

pub use codec::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use ids::{DeviceId, OperationId, UserId, MAX_ID_LEN};
pub use messages::{
    ConfirmRequest, ConfirmResponse, ErrorKind, ErrorResponse, GetRequest, OperationsResponse,
    PullRequest, PullResponse, PushRequest, PushResponse, SearchRequest, SyncMessage,
    PROTOCOL_VERSION,
};
pub use operation::{Operation, OrderKey, PushedOperation, TrackedEntity};
