//! Errors raised by simulation control.

use crate::participant::ParticipantKind;
use crate::simulation::SimulationStatus;
use encore_core::{CoreError, SimulationId};
use encore_storage::CheckpointError;

/// Control result type
pub type ControlResult<T> = Result<T, ControlError>;

/// Simulation control error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// No simulation is registered under the id
    #[error("No simulation registered as '{id}'")]
    NoSimulation {
        /// Registry key looked up
        id: SimulationId,
    },

    /// Operation requires a started simulation
    #[error("Cannot {operation} simulation '{id}': it is {status}")]
    InvalidState {
        /// Simulation id
        id: SimulationId,
        /// Operation attempted
        operation: &'static str,
        /// Status at the time
        status: SimulationStatus,
    },

    /// Another participant of the same kind already uses the name
    #[error("{kind} name '{name}' is already in use in simulation '{id}'")]
    DuplicateParticipant {
        /// Simulation id
        id: SimulationId,
        /// Participant kind
        kind: ParticipantKind,
        /// Conflicting name
        name: String,
    },

    /// The participant already belongs to a different simulation
    #[error("{kind} '{name}' is already bound to simulation '{bound_to}'")]
    AlreadyBound {
        /// Participant kind
        kind: ParticipantKind,
        /// Participant name
        name: String,
        /// Simulation the participant is bound to
        bound_to: SimulationId,
    },

    /// Checkpoint persistence failed
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Core failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<ControlError> for CoreError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Core(inner) => inner,
            ControlError::Checkpoint(inner) => inner.into(),
            ControlError::NoSimulation { id } => CoreError::NotFound {
                kind: "Simulation".to_string(),
                id: id.to_string(),
            },
            ControlError::InvalidState {
                operation, status, ..
            } => CoreError::InvalidState {
                operation: operation.to_string(),
                state: status.to_string(),
            },
            ControlError::DuplicateParticipant { kind, name, .. } => CoreError::AlreadyExists {
                kind: kind.to_string(),
                id: name,
            },
            ControlError::AlreadyBound { name, bound_to, .. } => CoreError::AlreadyExists {
                kind: "Binding".to_string(),
                id: format!("{} -> {}", name, bound_to),
            },
        }
    }
}
