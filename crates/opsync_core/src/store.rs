//! In-memory view of one user's operation log.

use crate::error::{OplogError, OplogResult};
use opsync_protocol::{Operation, OperationId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// An operation at its position in a user's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOperation {
    /// Delivery position, unique within the user's log.
    pub sequence: u64,
    /// Wall time of the append, used by retention.
    pub appended_at_ms: u64,
    /// The immutable operation.
    pub operation: Arc<Operation>,
}

/// The live operations of one user, keyed by sequence and by id.
///
/// Sequences are assigned contiguously from 1 and never reused. Pruned
/// operations leave holes; `head`, `pruned_total` and the pruned ids remember
/// what was there.
#[derive(Debug, Default)]
pub struct UserLog {
    by_sequence: BTreeMap<u64, StoredOperation>,
    by_id: HashMap<OperationId, u64>,
    pruned_ids: HashSet<OperationId>,
    head: u64,
    pruned_total: u64,
}

impl UserLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence ever assigned.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Number of operations removed by retention.
    pub fn pruned_total(&self) -> u64 {
        self.pruned_total
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.by_sequence.len()
    }

    /// Returns true if no operation is live.
    pub fn is_empty(&self) -> bool {
        self.by_sequence.is_empty()
    }

    /// Returns true if `id` is live in this log.
    pub fn contains_id(&self, id: &OperationId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Returns true if `id` is live or was pruned from this log.
    pub fn is_known(&self, id: &OperationId) -> bool {
        self.by_id.contains_key(id) || self.pruned_ids.contains(id)
    }

    /// Ids of pruned operations.
    pub fn pruned_ids(&self) -> impl Iterator<Item = &OperationId> {
        self.pruned_ids.iter()
    }

    /// Looks up a live operation by id.
    pub fn get_by_id(&self, id: &OperationId) -> Option<&StoredOperation> {
        self.by_id.get(id).and_then(|seq| self.by_sequence.get(seq))
    }

    /// Looks up a live operation by sequence.
    pub fn get(&self, sequence: u64) -> Option<&StoredOperation> {
        self.by_sequence.get(&sequence)
    }

    /// Sequence that the `offset`-th (0-based) next append will receive.
    pub fn sequence_after(&self, offset: usize) -> OplogResult<u64> {
        u64::try_from(offset)
            .ok()
            .and_then(|offset| self.head.checked_add(offset))
            .and_then(|seq| seq.checked_add(1))
            .ok_or_else(|| OplogError::Conflict("sequence space exhausted".into()))
    }

    /// Inserts an operation at its pre-assigned sequence.
    pub fn insert(&mut self, stored: StoredOperation) {
        self.head = self.head.max(stored.sequence);
        self.by_id
            .insert(stored.operation.id.clone(), stored.sequence);
        self.by_sequence.insert(stored.sequence, stored);
    }

    /// Removes the operation at `sequence`, counting it as pruned.
    pub fn prune(&mut self, sequence: u64) -> Option<StoredOperation> {
        let stored = self.by_sequence.remove(&sequence)?;
        self.by_id.remove(&stored.operation.id);
        self.pruned_ids.insert(stored.operation.id.clone());
        self.pruned_total += 1;
        Some(stored)
    }

    /// Restores the state that outlives pruned operations.
    pub fn restore_pruned(&mut self, head: u64, pruned_total: u64, pruned_ids: Vec<OperationId>) {
        self.head = self.head.max(head);
        self.pruned_total = pruned_total;
        self.pruned_ids.extend(pruned_ids);
    }

    /// Iterates live operations in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredOperation> {
        self.by_sequence.values()
    }

    /// Highest sequence below which nothing is live.
    ///
    /// Every sequence up to the returned one was pruned; with no live
    /// operations that is the head.
    pub fn gone_through(&self) -> u64 {
        self.by_sequence
            .keys()
            .next()
            .map_or(self.head, |&first| first - 1)
    }

    /// Resolves sequences to operations in log order, `(created_at, id)`.
    ///
    /// Sequences that are not live are skipped.
    pub fn ordered<I>(&self, sequences: I) -> Vec<&StoredOperation>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut found: Vec<&StoredOperation> = sequences
            .into_iter()
            .filter_map(|seq| self.by_sequence.get(&seq))
            .collect();
        sort_by_order_key(&mut found);
        found
    }
}

/// Sorts stored operations into log order.
pub fn sort_by_order_key(operations: &mut [&StoredOperation]) {
    operations.sort_by(|a, b| {
        (a.operation.created_at, &a.operation.id).cmp(&(b.operation.created_at, &b.operation.id))
    });
}
