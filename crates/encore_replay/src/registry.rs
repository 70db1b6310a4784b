//! Registry of simulations and the shared telemetry.

use crate::error::{ControlError, ControlResult};
use crate::participant::Participant;
use crate::simulation::{Simulation, SimulationConfig, SimulationStatus};
use crate::telemetry::Telemetry;
use encore_core::SimulationId;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

static GLOBAL: Lazy<Control> = Lazy::new(Control::new);

/// Control context: simulations by id plus hit/miss counters.
///
/// Most programs use the process-wide [`Control::global`] through the free
/// functions in [`crate::control`]. Tests and embedders can create isolated
/// contexts with [`Control::new`].
#[derive(Debug, Default)]
pub struct Control {
    simulations: Mutex<HashMap<SimulationId, Arc<Simulation>>>,
    telemetry: Arc<Telemetry>,
}

impl Control {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide context
    #[must_use]
    pub fn global() -> &'static Control {
        &GLOBAL
    }

    fn simulations(&self) -> MutexGuard<'_, HashMap<SimulationId, Arc<Simulation>>> {
        self.simulations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin the simulation `id`.
    ///
    /// A started simulation under `id` is returned as is and `config` is
    /// ignored. Otherwise a fresh simulation replaces whatever was registered,
    /// loading the checkpoint at the configured cache path if one exists.
    /// The registry stays locked until the new simulation is registered, so
    /// concurrent callers for one id share a single start.
    ///
    /// # Errors
    ///
    /// Returns error if the simulation cannot be started
    pub fn begin(&self, id: SimulationId, config: SimulationConfig) -> ControlResult<Arc<Simulation>> {
        let mut simulations = self.simulations();
        if let Some(existing) = simulations.get(&id) {
            if existing.is_started() {
                debug!(simulation = %id, "Simulation already started");
                return Ok(Arc::clone(existing));
            }
        }

        let simulation = Arc::new(Simulation::new(
            id.clone(),
            config,
            Arc::clone(&self.telemetry),
        ));
        simulation.begin()?;
        simulations.insert(id, Arc::clone(&simulation));
        Ok(simulation)
    }

    /// Simulation registered under `id`, in any status
    #[must_use]
    pub fn current_simulation(&self, id: &SimulationId) -> Option<Arc<Simulation>> {
        self.simulations().get(id).cloned()
    }

    fn require(&self, id: &SimulationId) -> ControlResult<Arc<Simulation>> {
        self.current_simulation(id)
            .ok_or_else(|| ControlError::NoSimulation { id: id.clone() })
    }

    /// Write the checkpoint of simulation `id`
    ///
    /// # Errors
    ///
    /// Returns error if no such simulation is started or the write fails
    pub fn checkpoint(&self, id: &SimulationId) -> ControlResult<()> {
        self.require(id)?.checkpoint()
    }

    /// End simulation `id`; it stays registered as stopped
    ///
    /// # Errors
    ///
    /// Returns error if no such simulation is started
    pub fn end(&self, id: &SimulationId) -> ControlResult<()> {
        self.require(id)?.end()
    }

    /// Ids of all registered simulations, sorted
    #[must_use]
    pub fn simulation_ids(&self) -> Vec<SimulationId> {
        let mut ids: Vec<_> = self.simulations().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Discard every simulation.
    ///
    /// Participants bound to a discarded simulation run uncached from then on.
    /// Telemetry is left alone; see [`Control::reset_telemetry`].
    pub fn reset(&self) {
        let drained: Vec<_> = self.simulations().drain().map(|(_, sim)| sim).collect();
        for simulation in &drained {
            simulation.discard();
        }
        info!(discarded = drained.len(), "Simulation registry reset");
    }

    /// Total replays served from checkpoints
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.telemetry.hits()
    }

    /// Total replay anomalies
    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.telemetry.misses()
    }

    /// Zero the hit/miss counters
    pub fn reset_telemetry(&self) {
        self.telemetry.reset();
    }

    /// Shared counters
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Register a newly constructed participant with the default simulation.
    ///
    /// See [`Control::enroll_in`].
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the participant is bound elsewhere
    pub fn enroll(&self, participant: &dyn Participant) -> ControlResult<bool> {
        self.enroll_in(&SimulationId::default(), participant)
    }

    /// Register a newly constructed participant with simulation `id`.
    ///
    /// Without a started simulation the participant stays free and
    /// `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the participant is bound elsewhere
    pub fn enroll_in(&self, id: &SimulationId, participant: &dyn Participant) -> ControlResult<bool> {
        match self.current_simulation(id) {
            Some(simulation) if simulation.is_started() => simulation.add_participant(participant),
            _ => Ok(false),
        }
    }

    /// Bind participants created outside any simulation to the started
    /// simulation `id`. Returns how many were newly bound.
    ///
    /// # Errors
    ///
    /// Returns error if the simulation is missing or not started, or a
    /// participant cannot be added
    pub fn capture_free(&self, id: &SimulationId, participants: &[&dyn Participant]) -> ControlResult<usize> {
        let simulation = self.require(id)?;
        let status = simulation.status();
        if status != SimulationStatus::Started {
            return Err(ControlError::InvalidState {
                id: id.clone(),
                operation: "capture participants for",
                status,
            });
        }

        let mut captured = 0;
        for participant in participants {
            if participant.binding().is_bound() {
                continue;
            }
            if simulation.add_participant(*participant)? {
                captured += 1;
            }
        }
        debug!(simulation = %id, captured, "Captured free participants");
        Ok(captured)
    }
}
