//! Core types for the Hydra multi-device particle orchestrator.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by every other crate in the workspace:
//! device and particle identifiers, the [`BufferSet`] bitset that
//! selects particle columns, the [`Command`] record posted to device
//! workers, and the error types of the external collaborators.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod command;
pub mod error;
pub mod id;

pub use buffer::{BufferKey, BufferSet, BufferSide};
pub use command::{Command, CommandFlags, CommandKind, IntegratorStep};
pub use error::{ModelError, SinkError, WorkerError};
pub use id::{
    CellHash, CellType, DeviceIndex, GlobalDeviceId, NodeRank, ParticleHash, ParticleId,
};
