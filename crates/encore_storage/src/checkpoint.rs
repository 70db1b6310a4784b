//! Checkpoint files for replayable execution traces.
//!
//! A checkpoint is a pretty-printed JSON document mapping call keys to the
//! qualified method name and the JSON-encoded result of each recorded call,
//! in recording order. Calls that ran but could not be recorded are listed
//! separately so a later replay expects them instead of reporting a miss.
//! Writes go to a temporary file next to the target and are renamed over it,
//! so a crash mid-write leaves the previous checkpoint intact.

use chrono::{DateTime, Utc};
use encore_core::{CallKey, CoreError, RunId, SimulationId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Format version written into every checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// File could not be read or written
    #[error("Checkpoint IO error at {path}: {reason}")]
    Io {
        /// Checkpoint path
        path: String,
        /// Rendered I/O error
        reason: String,
    },
    /// File content is not a checkpoint
    #[error("Corrupted checkpoint at {path}: {reason}")]
    Corrupted {
        /// Checkpoint path
        path: String,
        /// Parser message
        reason: String,
    },
    /// File was written by an incompatible format version
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build understands
        expected: u32,
        /// Version found in the file
        actual: u32,
    },
}

impl From<CheckpointError> for CoreError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Io { reason, .. } => CoreError::Io { reason },
            other => CoreError::ParseError {
                message: other.to_string(),
            },
        }
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Format version
    pub version: u32,
    /// Simulation that wrote the checkpoint
    pub simulation_id: SimulationId,
    /// Run that wrote the checkpoint
    pub run_id: Option<RunId>,
    /// When the checkpoint was written
    pub saved_at: DateTime<Utc>,
    /// Number of records
    pub entry_count: usize,
}

impl CheckpointMetadata {
    /// Create new metadata
    #[must_use]
    pub fn new(simulation_id: SimulationId) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            simulation_id,
            run_id: None,
            saved_at: Utc::now(),
            entry_count: 0,
        }
    }

    /// With run ID
    #[must_use]
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Qualified method name, e.g. `Agent::listen_and_act`
    pub method: String,
    /// JSON-encoded return value
    pub result: serde_json::Value,
}

impl CheckpointRecord {
    /// Create a record
    pub fn new(method: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            result,
        }
    }
}

/// Checkpoint document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Metadata
    pub metadata: CheckpointMetadata,
    /// Records by call key, in recording order
    pub records: IndexMap<CallKey, CheckpointRecord>,
    /// Calls executed without a record (failed or unencodable results),
    /// keyed to their qualified method name
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub uncached: IndexMap<CallKey, String>,
}

impl CheckpointFile {
    /// Create an empty checkpoint
    #[must_use]
    pub fn new(simulation_id: SimulationId) -> Self {
        Self {
            metadata: CheckpointMetadata::new(simulation_id),
            records: IndexMap::new(),
            uncached: IndexMap::new(),
        }
    }

    /// Build a checkpoint from a trace
    pub fn from_records<I>(simulation_id: SimulationId, run_id: RunId, records: I) -> Self
    where
        I: IntoIterator<Item = (CallKey, CheckpointRecord)>,
    {
        let mut file = Self {
            metadata: CheckpointMetadata::new(simulation_id).with_run(run_id),
            records: records.into_iter().collect(),
            uncached: IndexMap::new(),
        };
        file.update_metadata();
        file
    }

    /// Attach the calls that ran without leaving a record
    #[must_use]
    pub fn with_uncached<I>(mut self, uncached: I) -> Self
    where
        I: IntoIterator<Item = (CallKey, String)>,
    {
        self.uncached = uncached.into_iter().collect();
        self
    }

    /// Add a record
    pub fn insert(&mut self, key: CallKey, record: CheckpointRecord) {
        self.records.insert(key, record);
        self.update_metadata();
    }

    /// Get a record
    #[must_use]
    pub fn get(&self, key: &CallKey) -> Option<&CheckpointRecord> {
        self.records.get(key)
    }

    /// Get record count
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the checkpoint holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records whose qualified method name equals `method` or ends in `::method`
    pub fn find_by_method<'a>(
        &'a self,
        method: &'a str,
    ) -> impl Iterator<Item = (&'a CallKey, &'a CheckpointRecord)> + 'a {
        self.records.iter().filter(move |(_, record)| {
            record.method == method
                || record
                    .method
                    .rsplit_once("::")
                    .is_some_and(|(_, short)| short == method)
        })
    }

    /// Number of records per qualified method name
    #[must_use]
    pub fn method_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.values() {
            *counts.entry(record.method.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn update_metadata(&mut self) {
        self.metadata.entry_count = self.records.len();
    }

    /// Encode checkpoint to bytes
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn encode(&self, pretty: bool) -> Result<Vec<u8>, CheckpointError> {
        let encoded = if pretty {
            serde_json::to_vec_pretty(self)
        } else {
            serde_json::to_vec(self)
        };
        encoded.map_err(|e| CheckpointError::Corrupted {
            path: String::new(),
            reason: format!("Failed to encode checkpoint: {}", e),
        })
    }

    /// Decode checkpoint from bytes
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a checkpoint of this version
    pub fn decode(data: &[u8]) -> Result<Self, CheckpointError> {
        let file: Self = serde_json::from_slice(data).map_err(|e| CheckpointError::Corrupted {
            path: String::new(),
            reason: e.to_string(),
        })?;
        if file.metadata.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                actual: file.metadata.version,
            });
        }
        Ok(file)
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Pretty-print the JSON document
    pub pretty: bool,
    /// Create missing parent directories on save
    pub create_dirs: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            pretty: true,
            create_dirs: true,
        }
    }
}

/// Reads and writes the checkpoint at one path.
///
/// Saves through the same store are serialized by an internal lock.
pub struct CheckpointStore {
    path: PathBuf,
    config: CheckpointConfig,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Create a store for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, CheckpointConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(path: impl Into<PathBuf>, config: CheckpointConfig) -> Self {
        Self {
            path: path.into(),
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Checkpoint path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a checkpoint file exists at the path
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    fn io_error(&self, err: &std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.display_path(),
            reason: err.to_string(),
        }
    }

    /// Load the checkpoint.
    ///
    /// A missing file is not an error and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(&self) -> Result<Option<CheckpointFile>, CheckpointError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.display_path(), "No checkpoint found");
                return Ok(None);
            }
            Err(err) => return Err(self.io_error(&err)),
        };
        let file = CheckpointFile::decode(&data).map_err(|err| match err {
            CheckpointError::Corrupted { reason, .. } => CheckpointError::Corrupted {
                path: self.display_path(),
                reason,
            },
            other => other,
        })?;
        debug!(
            path = %self.display_path(),
            entries = file.len(),
            "Loaded checkpoint"
        );
        Ok(Some(file))
    }

    /// Load the checkpoint, treating unreadable or corrupted files as absent
    #[must_use]
    pub fn load_or_empty(&self) -> Option<CheckpointFile> {
        match self.load() {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    path = %self.display_path(),
                    error = %err,
                    "Ignoring unusable checkpoint, starting with an empty cache"
                );
                None
            }
        }
    }

    /// Write the checkpoint, replacing any previous one atomically
    ///
    /// # Errors
    ///
    /// Returns error if encoding, writing or renaming fails
    pub fn save(&self, file: &CheckpointFile) -> Result<(), CheckpointError> {
        let bytes = file.encode(self.config.pretty)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if self.config.create_dirs {
            std::fs::create_dir_all(&dir).map_err(|e| self.io_error(&e))?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_error(&e))?;
        tmp.write_all(&bytes).map_err(|e| self.io_error(&e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(&e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.io_error(&e.error))?;

        info!(
            path = %self.display_path(),
            entries = file.len(),
            "Checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::Hash;
    use serde_json::json;

    fn key(data: &str) -> CallKey {
        CallKey::canonical(Hash::compute(data.as_bytes()))
    }

    fn sample() -> CheckpointFile {
        let mut file = CheckpointFile::new(SimulationId::default());
        file.insert(
            key("a"),
            CheckpointRecord::new("CacheTestPerson::simple_method", json!({"processed_arg1": 30})),
        );
        file.insert(
            key("b"),
            CheckpointRecord::new("PersonFactory::_aux_model_call", json!("gazpacho")),
        );
        file
    }

    #[test]
    fn test_checkpoint_new() {
        let file = CheckpointFile::new(SimulationId::default());
        assert!(file.is_empty());
        assert_eq!(file.metadata.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_insert_updates_metadata() {
        let file = sample();
        assert_eq!(file.len(), 2);
        assert_eq!(file.metadata.entry_count, 2);
        assert!(file.get(&key("a")).is_some());
    }

    #[test]
    fn test_find_by_method() {
        let file = sample();
        assert_eq!(file.find_by_method("simple_method").count(), 1);
        assert_eq!(file.find_by_method("CacheTestPerson::simple_method").count(), 1);
        assert_eq!(file.find_by_method("define").count(), 0);
    }

    #[test]
    fn test_method_counts() {
        let counts = sample().method_counts();
        assert_eq!(counts.get("PersonFactory::_aux_model_call"), Some(&1));
    }

    #[test]
    fn test_encode_decode() {
        let file = sample();
        let decoded = CheckpointFile::decode(&file.encode(true).unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_records_keep_insertion_order_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("order.json"));
        let names = ["zeta", "alpha", "mu", "beta", "omega"];
        let mut file = CheckpointFile::new(SimulationId::default());
        for name in names {
            file.insert(key(name), CheckpointRecord::new(name, json!(name)));
        }
        store.save(&file).unwrap();

        let loaded = store.load().unwrap().unwrap();
        let methods: Vec<_> = loaded.records.values().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, names);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let first = raw.find(key("zeta").as_str()).unwrap();
        let last = raw.find(key("omega").as_str()).unwrap();
        assert!(first < last);
    }

    #[test]
    fn test_uncached_calls_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("uncached.json"));
        let file = sample().with_uncached([(key("failed"), "Agent::act".to_string())]);
        store.save(&file).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.uncached.get(&key("failed")).map(String::as_str), Some("Agent::act"));

        let plain = sample().encode(false).unwrap();
        assert!(!String::from_utf8(plain).unwrap().contains("uncached"));
    }

    #[test]
    fn test_decode_rejects_malformed_key() {
        let raw = json!({
            "metadata": sample().metadata,
            "records": {"not-a-key": {"method": "m", "result": 1}},
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            CheckpointFile::decode(&bytes),
            Err(CheckpointError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_other_version() {
        let mut file = sample();
        file.metadata.version = 99;
        let bytes = serde_json::to_vec(&file).unwrap();
        assert_eq!(
            CheckpointFile::decode(&bytes),
            Err(CheckpointError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                actual: 99
            })
        );
    }

    #[test]
    fn test_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("sim.cache.json"));
        assert!(!store.exists());

        store.save(&sample()).unwrap();
        assert!(store.exists());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("CacheTestPerson::simple_method"));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), None);
        assert!(store.load_or_empty().is_none());
    }

    #[test]
    fn test_store_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = CheckpointStore::new(&path);

        assert!(matches!(store.load(), Err(CheckpointError::Corrupted { .. })));
        assert!(store.load_or_empty().is_none());
    }

    #[test]
    fn test_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested/deeper/cache.json"));
        store.save(&sample()).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cache.json"));
        store.save(&sample()).unwrap();
        store
            .save(&CheckpointFile::new(SimulationId::default()))
            .unwrap();
        assert!(store.load().unwrap().unwrap().is_empty());
        // Only the checkpoint itself remains; temporary files were renamed away.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::VersionMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 1"));
    }
}
