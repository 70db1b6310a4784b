//! ENCORE Storage
//!
//! Durable checkpoints of execution traces and tools to compare them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod diff;

pub use checkpoint::{
    CHECKPOINT_VERSION, CheckpointConfig, CheckpointError, CheckpointFile, CheckpointMetadata,
    CheckpointRecord, CheckpointStore,
};
pub use diff::{CheckpointDiff, RecordChange};
