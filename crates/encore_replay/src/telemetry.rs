//! Cache hit/miss telemetry.
//!
//! A hit is a call served from a loaded checkpoint. A miss is an anomaly
//! during replay: a call the checkpoint should have covered but did not, or
//! a stored entry that could not be decoded. First-time recording is neither.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide hit/miss counters shared by every simulation of a context
#[derive(Debug, Default)]
pub struct Telemetry {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Telemetry {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a replay served from a checkpoint
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a replay anomaly
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total hits
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total misses
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Zero both counters
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Per-simulation call statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    /// Calls replayed from the loaded checkpoint
    pub hits: u64,
    /// Replay anomalies
    pub misses: u64,
    /// Calls executed and recorded in this run
    pub recorded: u64,
    /// Repeated calls served from this run's own trace
    pub reused: u64,
    /// Calls that ran without caching (nested or after the simulation stopped)
    pub bypassed: u64,
}

impl SimulationStats {
    /// Fraction of lookups against the checkpoint that replayed (1.0 when none)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 1.0;
        }
        self.hits as f64 / lookups as f64
    }
}
