//! Participants: the agents, environments and factories bound to a simulation.

use crate::error::{ControlError, ControlResult};
use crate::simulation::Simulation;
use encore_core::SimulationId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// Kind of participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParticipantKind {
    /// Simulated agent
    Agent,
    /// Environment hosting agents
    Environment,
    /// Factory producing agents
    Factory,
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Environment => write!(f, "environment"),
            Self::Factory => write!(f, "factory"),
        }
    }
}

/// Object whose methods can be intercepted.
///
/// Implementors embed a [`SimulationBinding`] and register themselves with
/// the current simulation when constructed (see
/// [`Control::enroll`](crate::Control::enroll)).
pub trait Participant: Send + Sync {
    /// Name, unique per kind within a simulation
    fn name(&self) -> &str;

    /// Participant kind
    fn kind(&self) -> ParticipantKind;

    /// Binding slot to the owning simulation
    fn binding(&self) -> &SimulationBinding;

    /// Type label used to qualify intercepted method names
    fn type_label(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Strip module path and generic parameters from a type name
#[must_use]
pub fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Registration record kept by a simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEntry {
    /// Participant kind
    pub kind: ParticipantKind,
    /// Participant name
    pub name: String,
    /// Type label
    pub type_label: String,
}

impl ParticipantEntry {
    /// Describe a participant
    #[must_use]
    pub fn of(participant: &dyn Participant) -> Self {
        Self {
            kind: participant.kind(),
            name: participant.name().to_string(),
            type_label: participant.type_label().to_string(),
        }
    }
}

struct Bound {
    id: SimulationId,
    simulation: Weak<Simulation>,
}

/// Slot binding a participant to at most one simulation.
///
/// The first simulation to bind wins; the binding never changes afterwards.
/// It holds a weak reference, so dropping the simulation (for example after a
/// registry reset) leaves the participant running uncached.
#[derive(Default)]
pub struct SimulationBinding {
    slot: OnceLock<Bound>,
}

impl SimulationBinding {
    /// Create an unbound slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a simulation has claimed this participant
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Id of the owning simulation
    #[must_use]
    pub fn simulation_id(&self) -> Option<&SimulationId> {
        self.slot.get().map(|b| &b.id)
    }

    /// Owning simulation, if it is still alive
    #[must_use]
    pub fn simulation(&self) -> Option<Arc<Simulation>> {
        self.slot.get().and_then(|b| b.simulation.upgrade())
    }

    /// Whether the binding points at `simulation`
    #[must_use]
    pub fn is_bound_to(&self, simulation: &Arc<Simulation>) -> bool {
        self.slot
            .get()
            .is_some_and(|b| Weak::ptr_eq(&b.simulation, &Arc::downgrade(simulation)))
    }

    /// Claim the slot for `simulation`.
    ///
    /// Returns `Ok(true)` when newly bound and `Ok(false)` when already bound
    /// to the same simulation.
    pub(crate) fn bind(
        &self,
        simulation: &Arc<Simulation>,
        participant: &dyn Participant,
    ) -> ControlResult<bool> {
        let bound = Bound {
            id: simulation.id().clone(),
            simulation: Arc::downgrade(simulation),
        };
        match self.slot.set(bound) {
            Ok(()) => Ok(true),
            Err(_) if self.is_bound_to(simulation) => Ok(false),
            Err(_) => Err(ControlError::AlreadyBound {
                kind: participant.kind(),
                name: participant.name().to_string(),
                bound_to: self
                    .simulation_id()
                    .cloned()
                    .unwrap_or_default(),
            }),
        }
    }
}

impl fmt::Debug for SimulationBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.simulation_id() {
            Some(id) => write!(f, "SimulationBinding({})", id),
            None => write!(f, "SimulationBinding(unbound)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Oscar {
        binding: SimulationBinding,
    }

    impl Participant for Oscar {
        fn name(&self) -> &str {
            "Oscar"
        }

        fn kind(&self) -> ParticipantKind {
            ParticipantKind::Agent
        }

        fn binding(&self) -> &SimulationBinding {
            &self.binding
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("my_crate::agents::Person"), "Person");
        assert_eq!(short_type_name("my_crate::World<my_crate::Person>"), "World");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_default_type_label() {
        let oscar = Oscar {
            binding: SimulationBinding::new(),
        };
        assert_eq!(oscar.type_label(), "Oscar");
        let dynamic: &dyn Participant = &oscar;
        assert_eq!(dynamic.type_label(), "Oscar");
    }

    #[test]
    fn test_unbound_binding() {
        let binding = SimulationBinding::new();
        assert!(!binding.is_bound());
        assert!(binding.simulation().is_none());
        assert_eq!(format!("{:?}", binding), "SimulationBinding(unbound)");
    }

    #[test]
    fn test_entry_of() {
        let oscar = Oscar {
            binding: SimulationBinding::new(),
        };
        let entry = ParticipantEntry::of(&oscar);
        assert_eq!(entry.kind, ParticipantKind::Agent);
        assert_eq!(entry.name, "Oscar");
    }
}
