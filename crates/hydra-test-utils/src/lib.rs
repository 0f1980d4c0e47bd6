//! Test utilities and emulated devices for Hydra development.
//!
//! Provides a host-memory [`EmulatedDevice`] that honours the buffer
//! semantics of the command set closely enough to drive a full
//! [`Simulation`](hydra_engine::Simulation), failure-injecting workers
//! and sinks, a configurable [`ScriptedModel`] and seeded particle
//! fixtures.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod device;
pub mod fixtures;
pub mod model;
pub mod sink;

pub use device::{CommandLog, EmulatedDevice, FailPoint, FailingDevice};
pub use fixtures::{emulated_devices, init_tracing, particle_cloud, unit_grid};
pub use model::{ModelCalls, ScriptedModel};
pub use sink::{FailingSink, RecordingSink, WriteRecord};
