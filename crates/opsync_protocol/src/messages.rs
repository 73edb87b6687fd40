//! Protocol messages exchanged between devices and the sync server.
//!
//! The authenticated `(user, device)` pair is never part of a message body;
//! the transport layer supplies it alongside every request.

use crate::codec::{from_cbor, to_cbor};
use crate::error::CodecResult;
use crate::ids::OperationId;
use crate::operation::{Operation, PushedOperation, TrackedEntity};
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Confirm request.
    ConfirmRequest(ConfirmRequest),
    /// Confirm response.
    ConfirmResponse(ConfirmResponse),
    /// Entity-scoped fetch.
    GetRequest(GetRequest),
    /// Payload search.
    SearchRequest(SearchRequest),
    /// Result of a get or search.
    OperationsResponse(OperationsResponse),
    /// Reset the calling device's cursor.
    ResetCursorRequest,
    /// Empty success acknowledgment.
    Ack,
    /// Request failed.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::PushRequest(_) => 1,
            SyncMessage::PushResponse(_) => 2,
            SyncMessage::PullRequest(_) => 3,
            SyncMessage::PullResponse(_) => 4,
            SyncMessage::ConfirmRequest(_) => 5,
            SyncMessage::ConfirmResponse(_) => 6,
            SyncMessage::GetRequest(_) => 7,
            SyncMessage::SearchRequest(_) => 8,
            SyncMessage::OperationsResponse(_) => 9,
            SyncMessage::ResetCursorRequest => 10,
            SyncMessage::Ack => 11,
            SyncMessage::Error(_) => 255,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// Appends newly authored operations to the caller's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Operations in authoring order.
    pub operations: Vec<PushedOperation>,
    /// Overrides the server default for confirming the pushed ids on the
    /// pushing device.
    #[serde(default)]
    pub auto_confirm: Option<bool>,
}

impl PushRequest {
    /// Creates a push request using the server's auto-confirm default.
    pub fn new(operations: Vec<PushedOperation>) -> Self {
        Self {
            operations,
            auto_confirm: None,
        }
    }

    /// Creates a push request from plain operations.
    pub fn from_operations(operations: impl IntoIterator<Item = Operation>) -> Self {
        Self::new(operations.into_iter().map(PushedOperation::from).collect())
    }

    /// Sets the auto-confirm override.
    #[must_use]
    pub fn with_auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = Some(auto_confirm);
        self
    }
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Ids appended by this push.
    pub appended: Vec<OperationId>,
    /// Ids that were already present (idempotent no-ops).
    pub duplicates: Vec<OperationId>,
    /// Highest sequence in the caller's log after the push.
    pub head_sequence: u64,
}

/// Fetches every operation not yet confirmed by the calling device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Withhold payloads above the server's large-operation threshold.
    #[serde(default)]
    pub ignore_large_operations: bool,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the large-operation policy.
    #[must_use]
    pub fn ignoring_large_operations(mut self) -> Self {
        self.ignore_large_operations = true;
        self
    }
}

/// Result of a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Pending operations in log order.
    pub operations: Vec<Operation>,
    /// Pending operations withheld because of their size.
    #[serde(default)]
    pub skipped_large: Vec<OperationId>,
    /// The device may have missed operations that were already pruned.
    #[serde(default)]
    pub history_gap: bool,
    /// Highest sequence in the caller's log.
    pub head_sequence: u64,
    /// More pending operations exist beyond this response's limit.
    #[serde(default)]
    pub has_more: bool,
}

/// Acknowledges operations the device durably applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    /// Ids to confirm, in any order.
    pub operation_ids: Vec<OperationId>,
}

impl ConfirmRequest {
    /// Creates a confirm request.
    pub fn new(operation_ids: Vec<OperationId>) -> Self {
        Self { operation_ids }
    }
}

/// Result of a confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    /// Number of ids that were not confirmed before.
    pub newly_confirmed: usize,
    /// Contiguous confirmation watermark of the device.
    pub confirmed_through: u64,
    /// Operations pruned by a retention sweep triggered by this confirm.
    pub pruned: usize,
}

/// Fetches the history of specific entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Entities of interest.
    pub entities: Vec<TrackedEntity>,
}

impl GetRequest {
    /// Creates a get request.
    pub fn new(entities: Vec<TrackedEntity>) -> Self {
        Self { entities }
    }
}

/// Searches payloads of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Payload type tag to search within.
    pub payload_type: String,
    /// Case-insensitive text to look for.
    pub hint: String,
}

impl SearchRequest {
    /// Creates a search request.
    pub fn new(payload_type: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
            hint: hint.into(),
        }
    }
}

/// Operations returned by get or search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsResponse {
    /// Matching operations in log order.
    pub operations: Vec<Operation>,
}

/// Coarse error classification for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request; do not retry unchanged.
    InvalidArgument,
    /// Authentication or authorization failure.
    Unauthorized,
    /// Transient failure; retry with backoff.
    Unavailable,
    /// Request exceeded its deadline or was cancelled.
    Timeout,
    /// Server bug or corruption.
    Internal,
}

/// Failure description sent back to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether the same request may succeed later.
    pub retryable: bool,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }
}
