//! Payload search index.
//!
//! Matching is a case-insensitive substring test over the payload decoded as
//! UTF-8 (invalid sequences become U+FFFD). The payload type must match
//! exactly. An empty hint matches every operation of the type.

use opsync_protocol::Operation;
use std::collections::{BTreeMap, HashMap};

/// Secondary index over payload type and payload text.
pub trait SearchIndex: Send + Sync {
    /// Indexes `operation` stored at `sequence`.
    fn insert(&mut self, sequence: u64, operation: &Operation);

    /// Removes the operation stored at `sequence`.
    fn remove(&mut self, sequence: u64, operation: &Operation);

    /// Returns sequences of `payload_type` operations matching `hint`,
    /// ascending.
    fn search(&self, payload_type: &str, hint: &str) -> Vec<u64>;

    /// Returns the number of indexed operations.
    fn len(&self) -> usize;

    /// Returns true if nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Substring-scanning [`SearchIndex`] holding lower-cased payload text.
#[derive(Debug, Default)]
pub struct SubstringSearchIndex {
    by_type: HashMap<String, BTreeMap<u64, String>>,
    count: usize,
}

impl SubstringSearchIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).to_lowercase()
    }
}

impl SearchIndex for SubstringSearchIndex {
    fn insert(&mut self, sequence: u64, operation: &Operation) {
        let text = Self::normalize(&operation.payload);
        let entries = self.by_type.entry(operation.payload_type.clone()).or_default();
        if entries.insert(sequence, text).is_none() {
            self.count += 1;
        }
    }

    fn remove(&mut self, sequence: u64, operation: &Operation) {
        if let Some(entries) = self.by_type.get_mut(&operation.payload_type) {
            if entries.remove(&sequence).is_some() {
                self.count -= 1;
                if entries.is_empty() {
                    self.by_type.remove(&operation.payload_type);
                }
            }
        }
    }

    fn search(&self, payload_type: &str, hint: &str) -> Vec<u64> {
        let Some(entries) = self.by_type.get(payload_type) else {
            return Vec::new();
        };
        let needle = hint.to_lowercase();
        entries
            .iter()
            .filter(|(_, text)| text.contains(&needle))
            .map(|(&seq, _)| seq)
            .collect()
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str, payload_type: &str, payload: &str) -> Operation {
        Operation::new(id, "alice", 0, payload_type, payload.as_bytes().to_vec())
    }

    #[test]
    fn case_insensitive_substring() {
        let mut index = SubstringSearchIndex::new();
        index.insert(1, &op("1", "friendship", "{\"name\":\"Alice Smith\"}"));
        index.insert(2, &op("2", "friendship", "{\"name\":\"Bob\"}"));
        index.insert(3, &op("3", "deal", "{\"title\":\"alice's dinner\"}"));

        assert_eq!(index.search("friendship", "ALICE"), vec![1]);
        assert_eq!(index.search("friendship", "smi"), vec![1]);
        assert_eq!(index.search("deal", "Alice"), vec![3]);
        assert!(index.search("friendship", "carol").is_empty());
    }

    #[test]
    fn empty_hint_matches_whole_type() {
        let mut index = SubstringSearchIndex::new();
        index.insert(1, &op("1", "deal", "a"));
        index.insert(2, &op("2", "deal", "b"));
        index.insert(3, &op("3", "friendship", "c"));

        assert_eq!(index.search("deal", ""), vec![1, 2]);
        assert!(index.search("unknown", "").is_empty());
    }

    #[test]
    fn non_utf8_payload_is_searchable() {
        let mut index = SubstringSearchIndex::new();
        let mut payload = b"caf\xC3\xA9 ".to_vec();
        payload.push(0xFF);
        payload.extend_from_slice(b"MENU");
        index.insert(1, &Operation::new("1", "alice", 0, "note", payload));

        assert_eq!(index.search("note", "CAFÉ"), vec![1]);
        assert_eq!(index.search("note", "menu"), vec![1]);
    }

    #[test]
    fn remove_updates_counts() {
        let mut index = SubstringSearchIndex::new();
        let operation = op("1", "deal", "x");
        index.insert(1, &operation);
        assert_eq!(index.len(), 1);
        index.remove(1, &operation);
        assert!(index.is_empty());
        assert!(index.search("deal", "").is_empty());
    }
}
