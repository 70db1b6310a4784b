//! Simulation lifecycle and per-simulation trace state.

use crate::error::{ControlError, ControlResult};
use crate::participant::{Participant, ParticipantEntry, ParticipantKind};
use crate::telemetry::{SimulationStats, Telemetry};
use crate::trace::{CallRecord, Trace};
use encore_core::{CallKey, RunId, SimulationId};
use encore_storage::{CheckpointConfig, CheckpointRecord, CheckpointStore};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Lifecycle status of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationStatus {
    /// Created, not yet begun
    Unstarted,
    /// Recording and replaying calls
    Started,
    /// Ended; calls run uncached
    Stopped,
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Checkpoint file; `None` keeps the trace in memory only
    pub cache_path: Option<PathBuf>,
    /// Write a checkpoint after every newly recorded call
    pub auto_checkpoint: bool,
    /// Checkpoint store options
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl SimulationConfig {
    /// Create the in-memory default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist checkpoints to `path`
    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Enable or disable checkpointing after every recorded call
    #[must_use]
    pub fn with_auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    /// Set checkpoint store options
    #[must_use]
    pub fn with_checkpoint_config(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint = config;
        self
    }
}

/// Result of looking up a call before running it
pub(crate) enum Lookup<'a, R> {
    /// Served from the loaded checkpoint
    Replayed(R),
    /// Served from this run's own trace
    Reused(R),
    /// Not recorded yet; the caller runs the call and records through the guard
    Execute(InflightGuard<'a>),
    /// Run directly without recording
    Bypass,
}

struct SimulationState {
    status: SimulationStatus,
    cached: Trace,
    execution: Trace,
    checkpoint_loaded: bool,
    consumed: HashSet<CallKey>,
    inflight: HashSet<CallKey>,
    participants: IndexMap<(ParticipantKind, String), ParticipantEntry>,
    stats: SimulationStats,
}

impl SimulationState {
    fn new() -> Self {
        Self {
            status: SimulationStatus::Unstarted,
            cached: Trace::new(),
            execution: Trace::new(),
            checkpoint_loaded: false,
            consumed: HashSet::new(),
            inflight: HashSet::new(),
            participants: IndexMap::new(),
            stats: SimulationStats::default(),
        }
    }

    fn pending(&self) -> usize {
        self.cached.len().saturating_sub(self.consumed.len())
    }
}

/// One simulation run: its traces, participants and checkpoint store.
///
/// All trace mutation happens under a single per-simulation lock that is never
/// held while a wrapped call executes. Concurrent calls with the same key
/// wait for the first executor instead of running twice.
pub struct Simulation {
    id: SimulationId,
    run_id: RunId,
    config: SimulationConfig,
    store: Option<CheckpointStore>,
    telemetry: Arc<Telemetry>,
    state: Mutex<SimulationState>,
    settled: Condvar,
    checkpoint_lock: Mutex<()>,
}

impl Simulation {
    pub(crate) fn new(id: SimulationId, config: SimulationConfig, telemetry: Arc<Telemetry>) -> Self {
        let store = config
            .cache_path
            .as_ref()
            .map(|path| CheckpointStore::with_config(path.clone(), config.checkpoint.clone()));
        Self {
            id,
            run_id: RunId::new(),
            config,
            store,
            telemetry,
            state: Mutex::new(SimulationState::new()),
            settled: Condvar::new(),
            checkpoint_lock: Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimulationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulation id
    #[must_use]
    pub fn id(&self) -> &SimulationId {
        &self.id
    }

    /// Identifier of this run
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Checkpoint path, if any
    #[must_use]
    pub fn cache_path(&self) -> Option<&Path> {
        self.store.as_ref().map(CheckpointStore::path)
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SimulationStatus {
        self.state().status
    }

    /// Whether the simulation is started
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.status() == SimulationStatus::Started
    }

    /// Statistics for this simulation alone
    #[must_use]
    pub fn stats(&self) -> SimulationStats {
        self.state().stats
    }

    /// Whether `begin` found a checkpoint to replay from
    #[must_use]
    pub fn checkpoint_loaded(&self) -> bool {
        self.state().checkpoint_loaded
    }

    /// Entries loaded from the checkpoint
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.state().cached.len()
    }

    /// Cached entries not yet replayed in this run
    #[must_use]
    pub fn pending_replays(&self) -> usize {
        self.state().pending()
    }

    /// Entries recorded or replayed in this run
    #[must_use]
    pub fn execution_len(&self) -> usize {
        self.state().execution.len()
    }

    /// Whether this run's trace holds `key`
    #[must_use]
    pub fn has_recorded(&self, key: &CallKey) -> bool {
        self.state().execution.contains(key)
    }

    /// Records loaded from the checkpoint
    #[must_use]
    pub fn cached_records(&self) -> Vec<CallRecord> {
        self.state().cached.records()
    }

    /// Records of this run, in recording order
    #[must_use]
    pub fn execution_records(&self) -> Vec<CallRecord> {
        self.state().execution.records()
    }

    /// Copy of this run's trace
    #[must_use]
    pub fn execution_trace(&self) -> Trace {
        self.state().execution.clone()
    }

    /// Start the simulation, loading the checkpoint if one exists.
    ///
    /// A started simulation is left untouched.
    pub(crate) fn begin(&self) -> ControlResult<()> {
        {
            let state = self.state();
            match state.status {
                SimulationStatus::Started => return Ok(()),
                SimulationStatus::Stopped => {
                    return Err(ControlError::InvalidState {
                        id: self.id.clone(),
                        operation: "begin",
                        status: state.status,
                    });
                }
                SimulationStatus::Unstarted => {}
            }
        }

        let loaded = self.store.as_ref().and_then(CheckpointStore::load_or_empty);

        let mut state = self.state();
        if state.status != SimulationStatus::Unstarted {
            return Ok(());
        }
        state.checkpoint_loaded = loaded.is_some();
        state.cached = loaded.map(Trace::from_checkpoint).unwrap_or_default();
        state.execution = Trace::new();
        state.consumed.clear();
        state.status = SimulationStatus::Started;

        info!(
            simulation = %self.id,
            run = %self.run_id,
            cached = state.cached.len(),
            "Simulation started"
        );
        Ok(())
    }

    /// Stop the simulation.
    ///
    /// Calls made afterwards run uncached. The trace is kept until the
    /// simulation is replaced or discarded.
    pub(crate) fn end(&self) -> ControlResult<()> {
        let mut state = self.state();
        if state.status != SimulationStatus::Started {
            return Err(ControlError::InvalidState {
                id: self.id.clone(),
                operation: "end",
                status: state.status,
            });
        }
        state.status = SimulationStatus::Stopped;
        self.settled.notify_all();
        info!(
            simulation = %self.id,
            recorded = state.stats.recorded,
            hits = state.stats.hits,
            misses = state.stats.misses,
            "Simulation ended"
        );
        Ok(())
    }

    /// Persist this run's trace to the checkpoint path.
    ///
    /// Without a cache path nothing is written.
    ///
    /// # Errors
    ///
    /// Returns error if the simulation is not started or the write fails
    pub fn checkpoint(&self) -> ControlResult<()> {
        let _serialized = self
            .checkpoint_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot = {
            let state = self.state();
            if state.status != SimulationStatus::Started {
                return Err(ControlError::InvalidState {
                    id: self.id.clone(),
                    operation: "checkpoint",
                    status: state.status,
                });
            }
            state.execution.to_checkpoint(self.id.clone(), self.run_id)
        };

        match &self.store {
            Some(store) => store.save(&snapshot)?,
            None => debug!(simulation = %self.id, "No cache path; checkpoint kept in memory"),
        }
        Ok(())
    }

    /// Register a participant and bind it to this simulation.
    ///
    /// Returns `Ok(false)` if it was already registered here.
    ///
    /// # Errors
    ///
    /// Returns error if another participant of the same kind uses the name, or
    /// the participant belongs to a different simulation
    pub fn add_participant(self: &Arc<Self>, participant: &dyn Participant) -> ControlResult<bool> {
        if participant.binding().is_bound_to(self) {
            return Ok(false);
        }

        let mut state = self.state();
        let slot = (participant.kind(), participant.name().to_string());
        if state.participants.contains_key(&slot) {
            return Err(ControlError::DuplicateParticipant {
                id: self.id.clone(),
                kind: participant.kind(),
                name: participant.name().to_string(),
            });
        }
        participant.binding().bind(self, participant)?;
        state.participants.insert(slot, ParticipantEntry::of(participant));
        debug!(
            simulation = %self.id,
            kind = %participant.kind(),
            name = participant.name(),
            "Participant added"
        );
        Ok(true)
    }

    /// Whether a participant of `kind` named `name` is registered
    #[must_use]
    pub fn has_participant(&self, kind: ParticipantKind, name: &str) -> bool {
        self.state()
            .participants
            .contains_key(&(kind, name.to_string()))
    }

    /// Registered participants in registration order
    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantEntry> {
        self.state().participants.values().cloned().collect()
    }

    /// Stop and drop all state; used when the registry is reset
    pub(crate) fn discard(&self) {
        let mut state = self.state();
        state.status = SimulationStatus::Stopped;
        state.cached.clear();
        state.execution.clear();
        state.consumed.clear();
        state.participants.clear();
        self.settled.notify_all();
    }

    pub(crate) fn record_bypass(&self) {
        self.state().stats.bypassed += 1;
    }

    /// Resolve `key` against this run's trace and the loaded checkpoint.
    ///
    /// Blocks while another thread is executing the same key.
    pub(crate) fn lookup<R: DeserializeOwned>(&self, key: &CallKey, method: &str) -> ControlResult<Lookup<'_, R>> {
        let mut state = self.state();
        loop {
            match state.status {
                SimulationStatus::Unstarted => {
                    return Err(ControlError::InvalidState {
                        id: self.id.clone(),
                        operation: "intercept a call in",
                        status: state.status,
                    });
                }
                SimulationStatus::Stopped => {
                    state.stats.bypassed += 1;
                    return Ok(Lookup::Bypass);
                }
                SimulationStatus::Started => {}
            }

            if let Some(record) = state.execution.get(key) {
                return match serde_json::from_value::<R>(record.result.clone()) {
                    Ok(value) => {
                        state.stats.reused += 1;
                        debug!(simulation = %self.id, method, key = %key, "Reusing result from this run");
                        Ok(Lookup::Reused(value))
                    }
                    Err(err) => {
                        warn!(
                            simulation = %self.id,
                            method,
                            error = %err,
                            "Recorded result has a different shape; running uncached"
                        );
                        state.stats.bypassed += 1;
                        Ok(Lookup::Bypass)
                    }
                };
            }

            if !state.inflight.contains(key) {
                break;
            }
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(record) = state.cached.get(key).cloned() {
            state.consumed.insert(key.clone());
            match serde_json::from_value::<R>(record.result.clone()) {
                Ok(value) => {
                    state.execution.insert_if_absent(key.clone(), record);
                    state.stats.hits += 1;
                    self.telemetry.record_hit();
                    debug!(simulation = %self.id, method, key = %key, "Replayed from checkpoint");
                    return Ok(Lookup::Replayed(value));
                }
                Err(err) => {
                    state.stats.misses += 1;
                    self.telemetry.record_miss();
                    warn!(
                        simulation = %self.id,
                        method,
                        key = %key,
                        error = %err,
                        "Cached result cannot be decoded; executing again"
                    );
                }
            }
        } else if state.checkpoint_loaded && state.pending() > 0 && !state.cached.is_uncached(key) {
            state.stats.misses += 1;
            self.telemetry.record_miss();
            debug!(
                simulation = %self.id,
                method,
                key = %key,
                pending = state.pending(),
                "Call diverges from the loaded checkpoint"
            );
        }

        state.inflight.insert(key.clone());
        Ok(Lookup::Execute(InflightGuard {
            simulation: self,
            key: key.clone(),
            method: method.to_string(),
            recorded: false,
        }))
    }

    fn auto_checkpoint(&self) {
        if !self.config.auto_checkpoint {
            return;
        }
        if let Err(err) = self.checkpoint() {
            error!(simulation = %self.id, error = %err, "Automatic checkpoint failed");
        }
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("status", &self.status())
            .field("cache_path", &self.cache_path())
            .finish()
    }
}

/// Claim on a key being executed by the current thread.
///
/// Dropping the guard without recording releases the key so a waiting
/// thread can execute it instead, and notes the call as executed without a
/// record so the next replay of this trace expects it.
pub(crate) struct InflightGuard<'a> {
    simulation: &'a Simulation,
    key: CallKey,
    method: String,
    recorded: bool,
}

impl InflightGuard<'_> {
    /// Store the result under the claimed key
    pub(crate) fn record(mut self, result: serde_json::Value) {
        let simulation = self.simulation;
        let inserted = {
            let mut state = simulation.state();
            let inserted = state.status == SimulationStatus::Started
                && state
                    .execution
                    .insert_if_absent(self.key.clone(), CheckpointRecord::new(&self.method, result));
            if inserted {
                state.stats.recorded += 1;
                debug!(simulation = %simulation.id, method = %self.method, key = %self.key, "Recorded call");
            }
            inserted
        };
        self.recorded = true;
        drop(self);
        if inserted {
            simulation.auto_checkpoint();
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.simulation.state();
        state.inflight.remove(&self.key);
        if !self.recorded && state.status == SimulationStatus::Started {
            state.execution.mark_uncached(self.key.clone(), &self.method);
            debug!(
                simulation = %self.simulation.id,
                method = %self.method,
                key = %self.key,
                "Call finished without a record"
            );
        }
        self.simulation.settled.notify_all();
    }
}
