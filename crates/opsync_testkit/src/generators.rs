//! Property-based test generators using proptest.
//!
//! Strategies produce valid operations for a fixed author, so generated
//! batches are always accepted by a push.

use opsync_protocol::{Operation, TrackedEntity};
use proptest::prelude::*;

/// Strategy for operation ids drawn from a small pool, so batches repeat ids.
pub fn pooled_id_strategy(pool: usize) -> impl Strategy<Value = String> {
    (0..pool.max(1)).prop_map(|n| format!("op-{n:03}"))
}

/// Strategy for tracked entities over a few entity types and ids.
pub fn tracked_entity_strategy() -> impl Strategy<Value = TrackedEntity> {
    (
        prop::sample::select(vec!["deal", "contact", "task"]),
        0u8..6,
    )
        .prop_map(|(entity_type, n)| TrackedEntity::new(entity_type, format!("E{n}")))
}

/// Strategy for payload text, mixing case so searches exercise folding.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("[a-zA-Z ]{0,40}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}

/// Strategy for a valid operation authored by `author`.
///
/// Creation times collide often, so ordering falls back to the id.
pub fn operation_strategy(
    author: &'static str,
    id_pool: usize,
) -> impl Strategy<Value = Operation> {
    (
        pooled_id_strategy(id_pool),
        0u64..50,
        prop::sample::select(vec!["deal", "note"]),
        payload_strategy(),
        prop::collection::vec(tracked_entity_strategy(), 0..3),
    )
        .prop_map(move |(id, created_at, payload_type, payload, entities)| {
            let mut op = Operation::new(id, author, created_at, payload_type, payload);
            for entity in entities {
                op = op.tracking(entity.entity_type, entity.entity_id);
            }
            op
        })
}

/// Strategy for a batch of operations, possibly repeating ids.
pub fn batch_strategy(
    author: &'static str,
    id_pool: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(operation_strategy(author, id_pool), 0..max_len.max(1))
}

/// Strategy for several batches pushed one after another.
pub fn batches_strategy(
    author: &'static str,
    id_pool: usize,
) -> impl Strategy<Value = Vec<Vec<Operation>>> {
    prop::collection::vec(batch_strategy(author, id_pool, 8), 1..6)
}

/// One step of a device session.
#[derive(Debug, Clone)]
pub enum DeviceAction {
    /// Push a batch from a device.
    Push {
        /// Device index.
        device: usize,
        /// Operations pushed.
        batch: Vec<Operation>,
    },
    /// Pull for a device.
    Pull {
        /// Device index.
        device: usize,
    },
    /// Confirm everything the device last pulled.
    ConfirmPulled {
        /// Device index.
        device: usize,
    },
}

/// Strategy for a session of pushes, pulls and confirms over `devices`
/// devices of one user.
pub fn session_strategy(
    author: &'static str,
    devices: usize,
) -> impl Strategy<Value = Vec<DeviceAction>> {
    let devices = devices.max(1);
    let action = prop_oneof![
        (0..devices, batch_strategy(author, 24, 5))
            .prop_map(|(device, batch)| DeviceAction::Push { device, batch }),
        (0..devices).prop_map(|device| DeviceAction::Pull { device }),
        (0..devices).prop_map(|device| DeviceAction::ConfirmPulled { device }),
    ];
    prop::collection::vec(action, 1..30)
}
