//! ENCORE Replay
//!
//! Simulation control and deterministic replay of transactional calls.
//! Calls wrapped in a [`Transaction`] are keyed by their argument signature,
//! recorded on first execution and replayed from checkpoints on later runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;
pub mod interceptor;
pub mod participant;
pub mod registry;
pub mod simulation;
pub mod telemetry;
pub mod trace;

pub use error::{ControlError, ControlResult};
pub use interceptor::Transaction;
pub use participant::{Participant, ParticipantEntry, ParticipantKind, SimulationBinding};
pub use registry::Control;
pub use simulation::{Simulation, SimulationConfig, SimulationStatus};
pub use telemetry::{SimulationStats, Telemetry};
pub use trace::{CallRecord, Trace};
