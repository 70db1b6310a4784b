//! Comparison of two checkpoints.

use crate::checkpoint::{CheckpointFile, CheckpointRecord};
use encore_core::CallKey;
use serde::{Deserialize, Serialize};

/// Record that differs between two checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    /// Call key
    pub key: CallKey,
    /// Record on the left side
    pub left: CheckpointRecord,
    /// Record on the right side
    pub right: CheckpointRecord,
}

/// Result of comparing two checkpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    /// Keys recorded only on the left
    pub only_left: Vec<(CallKey, String)>,
    /// Keys recorded only on the right
    pub only_right: Vec<(CallKey, String)>,
    /// Keys recorded on both sides with different method or result
    pub changed: Vec<RecordChange>,
}

impl CheckpointDiff {
    /// Compare two checkpoints
    #[must_use]
    pub fn compare(left: &CheckpointFile, right: &CheckpointFile) -> Self {
        let mut diff = Self::default();

        for (key, record) in &left.records {
            match right.records.get(key) {
                None => diff.only_left.push((key.clone(), record.method.clone())),
                Some(other) if other != record => diff.changed.push(RecordChange {
                    key: key.clone(),
                    left: record.clone(),
                    right: other.clone(),
                }),
                Some(_) => {}
            }
        }
        for (key, record) in &right.records {
            if !left.records.contains_key(key) {
                diff.only_right.push((key.clone(), record.method.clone()));
            }
        }

        diff
    }

    /// Whether both checkpoints hold the same records
    #[must_use]
    pub fn is_identical(&self) -> bool {
        self.only_left.is_empty() && self.only_right.is_empty() && self.changed.is_empty()
    }

    /// Total number of differences
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.only_left.len() + self.only_right.len() + self.changed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::{Hash, SimulationId};
    use serde_json::json;

    fn key(data: &str) -> CallKey {
        CallKey::canonical(Hash::compute(data.as_bytes()))
    }

    fn file(entries: &[(&str, &str, serde_json::Value)]) -> CheckpointFile {
        let mut file = CheckpointFile::new(SimulationId::default());
        for (k, method, result) in entries {
            file.insert(key(k), CheckpointRecord::new(*method, result.clone()));
        }
        file
    }

    #[test]
    fn test_identical_checkpoints() {
        let a = file(&[("k1", "A::m", json!(1))]);
        let b = file(&[("k1", "A::m", json!(1))]);
        let diff = CheckpointDiff::compare(&a, &b);
        assert!(diff.is_identical());
        assert_eq!(diff.change_count(), 0);
    }

    #[test]
    fn test_added_removed_changed() {
        let a = file(&[("k1", "A::m", json!(1)), ("k2", "A::n", json!("x"))]);
        let b = file(&[("k1", "A::m", json!(2)), ("k3", "B::m", json!(null))]);
        let diff = CheckpointDiff::compare(&a, &b);

        assert_eq!(diff.only_left, vec![(key("k2"), "A::n".to_string())]);
        assert_eq!(diff.only_right, vec![(key("k3"), "B::m".to_string())]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].left.result, json!(1));
        assert_eq!(diff.changed[0].right.result, json!(2));
        assert_eq!(diff.change_count(), 3);
    }
}
