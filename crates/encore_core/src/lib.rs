//! ENCORE Core Types
//!
//! This crate contains pure types and logic with no I/O: call keys,
//! canonical argument encoding and the call signature hasher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod hash;
pub mod id;
pub mod signature;

// Re-exports
pub use encoding::{CanonicalEncode, CanonicalValue, EncodeError, Opaque, to_canonical, to_canonical_lenient};
pub use error::{CoreError, CoreResult};
pub use hash::{CallKey, Hash, HashError};
pub use id::{RunId, SimulationId};
pub use signature::{CallArgs, CallSignature, FALLBACK_MARKER, call_key};
