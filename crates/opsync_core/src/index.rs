//! Tracked-entity index.
//!
//! Maps `(entity_type, entity_id)` to the sequences of the operations that
//! affect it. The index lives next to the user's log under the same lock and
//! is updated in the same step as the log, so it never names an operation the
//! log does not hold.

use opsync_protocol::{Operation, TrackedEntity};
use std::collections::{BTreeSet, HashMap};

/// Secondary index from tracked entities to log sequences.
pub trait EntityIndex: Send + Sync {
    /// Indexes `operation` stored at `sequence`.
    fn insert(&mut self, sequence: u64, operation: &Operation);

    /// Removes `operation` stored at `sequence`.
    fn remove(&mut self, sequence: u64, operation: &Operation);

    /// Returns the sequences of operations affecting any of `entities`.
    fn lookup(&self, entities: &[TrackedEntity]) -> BTreeSet<u64>;

    /// Returns the number of (entity, sequence) entries.
    fn len(&self) -> usize;

    /// Returns true if the index holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-based [`EntityIndex`].
#[derive(Debug, Default)]
pub struct HashEntityIndex {
    entries: HashMap<TrackedEntity, BTreeSet<u64>>,
    count: usize,
}

impl HashEntityIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct entities indexed.
    pub fn entity_count(&self) -> usize {
        self.entries.len()
    }
}

impl EntityIndex for HashEntityIndex {
    fn insert(&mut self, sequence: u64, operation: &Operation) {
        for entity in &operation.tracked_entities {
            if self.entries.entry(entity.clone()).or_default().insert(sequence) {
                self.count += 1;
            }
        }
    }

    fn remove(&mut self, sequence: u64, operation: &Operation) {
        for entity in &operation.tracked_entities {
            if let Some(set) = self.entries.get_mut(entity) {
                if set.remove(&sequence) {
                    self.count -= 1;
                    if set.is_empty() {
                        self.entries.remove(entity);
                    }
                }
            }
        }
    }

    fn lookup(&self, entities: &[TrackedEntity]) -> BTreeSet<u64> {
        entities
            .iter()
            .filter_map(|entity| self.entries.get(entity))
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    fn len(&self) -> usize {
        self.count
    }
}
