//! In-memory execution traces.

use encore_core::{CallKey, RunId, SimulationId};
use encore_storage::{CheckpointFile, CheckpointRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One recorded call with its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call key
    pub key: CallKey,
    /// Qualified method name
    pub method: String,
    /// JSON-encoded result
    pub result: serde_json::Value,
}

/// Mapping of call keys to recorded results, in first-recorded order.
///
/// Entries are never replaced: a key keeps the first result recorded for it.
/// Calls that executed without producing a record are remembered separately
/// and never replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    entries: IndexMap<CallKey, CheckpointRecord>,
    uncached: IndexMap<CallKey, String>,
}

impl Trace {
    /// Create an empty trace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trace from a loaded checkpoint
    #[must_use]
    pub fn from_checkpoint(file: CheckpointFile) -> Self {
        Self {
            entries: file.records,
            uncached: file.uncached,
        }
    }

    /// Snapshot the trace as a checkpoint document
    #[must_use]
    pub fn to_checkpoint(&self, simulation_id: SimulationId, run_id: RunId) -> CheckpointFile {
        CheckpointFile::from_records(
            simulation_id,
            run_id,
            self.entries
                .iter()
                .map(|(key, record)| (key.clone(), record.clone())),
        )
        .with_uncached(self.uncached.clone())
    }

    /// Get a record
    #[must_use]
    pub fn get(&self, key: &CallKey) -> Option<&CheckpointRecord> {
        self.entries.get(key)
    }

    /// Whether the key was recorded
    #[must_use]
    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Record a result unless the key already has one.
    ///
    /// Returns `true` when the entry was added.
    pub fn insert_if_absent(&mut self, key: CallKey, record: CheckpointRecord) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.uncached.shift_remove(&key);
        self.entries.insert(key, record);
        true
    }

    /// Remember a call that ran but left no record.
    ///
    /// Ignored when the key already has a record.
    pub fn mark_uncached(&mut self, key: CallKey, method: &str) {
        if !self.entries.contains_key(&key) {
            self.uncached
                .entry(key)
                .or_insert_with(|| method.to_string());
        }
    }

    /// Whether the call ran without leaving a record
    #[must_use]
    pub fn is_uncached(&self, key: &CallKey) -> bool {
        self.uncached.contains_key(key)
    }

    /// Number of calls that ran without leaving a record
    #[must_use]
    pub fn uncached_len(&self) -> usize {
        self.uncached.len()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the trace is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in recording order
    pub fn keys(&self) -> impl Iterator<Item = &CallKey> {
        self.entries.keys()
    }

    /// Records in recording order
    #[must_use]
    pub fn records(&self) -> Vec<CallRecord> {
        self.entries
            .iter()
            .map(|(key, record)| CallRecord {
                key: key.clone(),
                method: record.method.clone(),
                result: record.result.clone(),
            })
            .collect()
    }

    /// Number of entries recorded for a qualified method name
    #[must_use]
    pub fn count_method(&self, method: &str) -> usize {
        self.entries.values().filter(|r| r.method == method).count()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.uncached.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::Hash;
    use proptest::prelude::*;
    use serde_json::json;

    fn key(data: &str) -> CallKey {
        CallKey::canonical(Hash::compute(data.as_bytes()))
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let mut trace = Trace::new();
        assert!(trace.insert_if_absent(key("a"), CheckpointRecord::new("A::m", json!(1))));
        assert!(!trace.insert_if_absent(key("a"), CheckpointRecord::new("A::m", json!(2))));
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.get(&key("a")).unwrap().result, json!(1));
    }

    #[test]
    fn test_recording_order_preserved() {
        let mut trace = Trace::new();
        for name in ["c", "a", "b"] {
            trace.insert_if_absent(key(name), CheckpointRecord::new("A::m", json!(name)));
        }
        let results: Vec<_> = trace.records().into_iter().map(|r| r.result).collect();
        assert_eq!(results, vec![json!("c"), json!("a"), json!("b")]);
    }

    #[test]
    fn test_checkpoint_conversion() {
        let mut trace = Trace::new();
        trace.insert_if_absent(key("a"), CheckpointRecord::new("A::m", json!(1)));
        trace.insert_if_absent(key("b"), CheckpointRecord::new("B::n", json!(2)));

        let file = trace.to_checkpoint(SimulationId::default(), RunId::new());
        assert_eq!(file.metadata.entry_count, 2);

        let restored = Trace::from_checkpoint(file);
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&key("b")));
        assert_eq!(restored.count_method("A::m"), 1);
    }

    #[test]
    fn test_uncached_calls_round_trip() {
        let mut trace = Trace::new();
        trace.insert_if_absent(key("a"), CheckpointRecord::new("A::m", json!(1)));
        trace.mark_uncached(key("a"), "A::m");
        trace.mark_uncached(key("e"), "A::fails");
        assert!(!trace.is_uncached(&key("a")));
        assert!(trace.is_uncached(&key("e")));

        let restored = Trace::from_checkpoint(trace.to_checkpoint(SimulationId::default(), RunId::new()));
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.uncached_len(), 1);
        assert!(restored.is_uncached(&key("e")));

        let mut later = restored;
        later.insert_if_absent(key("e"), CheckpointRecord::new("A::fails", json!(2)));
        assert!(!later.is_uncached(&key("e")));
        assert_eq!(later.uncached_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_first_result_wins(calls in proptest::collection::vec((0u8..8, any::<i64>()), 0..64)) {
            let mut trace = Trace::new();
            let mut first = std::collections::HashMap::new();
            for (name, value) in &calls {
                trace.insert_if_absent(key(&name.to_string()), CheckpointRecord::new("A::m", json!(value)));
                first.entry(*name).or_insert(*value);
            }
            prop_assert_eq!(trace.len(), first.len());
            for (name, value) in first {
                prop_assert_eq!(&trace.get(&key(&name.to_string())).unwrap().result, &json!(value));
            }
        }
    }
}
