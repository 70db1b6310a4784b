//! Free functions over the process-wide [`Control`] context.
//!
//! These operate on the simulation registered as `"default"` unless an id is
//! given explicitly.

use crate::error::ControlResult;
use crate::participant::Participant;
use crate::registry::Control;
use crate::simulation::{Simulation, SimulationConfig};
use encore_core::SimulationId;
use std::path::Path;
use std::sync::Arc;

/// Discard every simulation of the process-wide context
pub fn reset() {
    Control::global().reset();
}

/// Begin the default simulation, replaying from `cache_path` if it exists
///
/// # Errors
///
/// Returns error if the simulation cannot be started
pub fn begin(cache_path: Option<&Path>) -> ControlResult<Arc<Simulation>> {
    let config = match cache_path {
        Some(path) => SimulationConfig::new().with_cache_path(path),
        None => SimulationConfig::new(),
    };
    begin_with(SimulationId::default(), config)
}

/// Begin simulation `id` with an explicit configuration
///
/// # Errors
///
/// Returns error if the simulation cannot be started
pub fn begin_with(id: SimulationId, config: SimulationConfig) -> ControlResult<Arc<Simulation>> {
    Control::global().begin(id, config)
}

/// Write the default simulation's checkpoint
///
/// # Errors
///
/// Returns error if the default simulation is not started or the write fails
pub fn checkpoint() -> ControlResult<()> {
    Control::global().checkpoint(&SimulationId::default())
}

/// End the default simulation
///
/// # Errors
///
/// Returns error if the default simulation is not started
pub fn end() -> ControlResult<()> {
    Control::global().end(&SimulationId::default())
}

/// The default simulation, if one is registered
#[must_use]
pub fn current_simulation() -> Option<Arc<Simulation>> {
    simulation(&SimulationId::default())
}

/// Simulation registered under `id`
#[must_use]
pub fn simulation(id: &SimulationId) -> Option<Arc<Simulation>> {
    Control::global().current_simulation(id)
}

/// Register a newly constructed participant with the default simulation
///
/// # Errors
///
/// Returns error if the name is taken or the participant is bound elsewhere
pub fn enroll(participant: &dyn Participant) -> ControlResult<bool> {
    Control::global().enroll(participant)
}

/// Process-wide replay hits
#[must_use]
pub fn cache_hits() -> u64 {
    Control::global().cache_hits()
}

/// Process-wide replay misses
#[must_use]
pub fn cache_misses() -> u64 {
    Control::global().cache_misses()
}
