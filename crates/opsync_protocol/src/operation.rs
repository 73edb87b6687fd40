//! Operations and tracked entities.

use crate::codec::{from_cbor, to_cbor};
use crate::error::CodecResult;
use crate::ids::{OperationId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An abstract `(type, id)` reference to something an operation affects,
/// e.g. `("deal", "D1")` or `("friendship", "F7")`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Kind of entity.
    pub entity_type: String,
    /// Identifier of the entity within its kind.
    pub entity_id: String,
}

impl TrackedEntity {
    /// Creates a tracked entity reference.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Returns true if both parts are non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.entity_type.is_empty() && !self.entity_id.is_empty()
    }
}

impl fmt::Display for TrackedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Position of an operation in a user's log.
///
/// Field order matters: the derived `Ord` compares `created_at` first and
/// falls back to the lexicographic id, which gives every replica the same
/// sequence even with clock skew or simultaneous authorship.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    /// Author-supplied timestamp.
    pub created_at: u64,
    /// Operation id tie-breaker.
    pub id: OperationId,
}

/// An immutable, client-authored change.
///
/// The engine never interprets `payload`; `payload_type` is the only tag it
/// reads, and only for search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique id assigned by the author.
    pub id: OperationId,
    /// Account that created the operation.
    pub author: UserId,
    /// Author-supplied logical/wall timestamp used for ordering.
    pub created_at: u64,
    /// Type tag of the payload (e.g. `"deal"`).
    pub payload_type: String,
    /// Opaque payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Entities this operation affects, without duplicates.
    #[serde(default)]
    pub tracked_entities: Vec<TrackedEntity>,
}

impl Operation {
    /// Creates an operation with no tracked entities.
    pub fn new(
        id: impl Into<OperationId>,
        author: impl Into<UserId>,
        created_at: u64,
        payload_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            created_at,
            payload_type: payload_type.into(),
            payload,
            tracked_entities: Vec::new(),
        }
    }

    /// Adds a tracked entity, ignoring repeats.
    #[must_use]
    pub fn tracking(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        let entity = TrackedEntity::new(entity_type, entity_id);
        if !self.tracked_entities.contains(&entity) {
            self.tracked_entities.push(entity);
        }
        self
    }

    /// Returns the key that places this operation in the log order.
    #[must_use]
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    /// Returns true if `entity` is among the tracked entities.
    #[must_use]
    pub fn affects(&self, entity: &TrackedEntity) -> bool {
        self.tracked_entities.contains(entity)
    }

    /// Removes repeated tracked entities, keeping the first occurrence.
    pub fn dedup_tracked_entities(&mut self) {
        let mut seen = Vec::with_capacity(self.tracked_entities.len());
        self.tracked_entities.retain(|entity| {
            if seen.contains(entity) {
                false
            } else {
                seen.push(entity.clone());
                true
            }
        });
    }

    /// Returns the size of the payload in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// An operation as submitted by a device, with the counterparties that
/// should receive a copy in their own logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedOperation {
    /// The operation itself.
    pub operation: Operation,
    /// Other users (e.g. friends on a shared deal) that get a copy.
    #[serde(default)]
    pub share_with: Vec<UserId>,
}

impl PushedOperation {
    /// Shares the operation with an additional counterparty.
    #[must_use]
    pub fn share_with(mut self, user: impl Into<UserId>) -> Self {
        let user = user.into();
        if !self.share_with.contains(&user) {
            self.share_with.push(user);
        }
        self
    }
}

impl From<Operation> for PushedOperation {
    fn from(operation: Operation) -> Self {
        Self {
            operation,
            share_with: Vec::new(),
        }
    }
}
