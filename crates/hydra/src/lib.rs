//! Hydra: the host-side orchestration core of a multi-device,
//! multi-node SPH particle simulation.
//!
//! This is the top-level facade crate that re-exports the public API
//! of the Hydra sub-crates. Device kernels live behind the
//! [`DeviceWorker`](engine::DeviceWorker) trait; Hydra partitions the
//! particles, drives one worker thread per device through a
//! barrier-synchronized command protocol and runs the integration loop.
//!
//! # Quick start
//!
//! ```rust
//! use hydra::prelude::*;
//! use hydra::arena::{BufferList, Multiplicity, ParticleInfo};
//! use hydra::types::ParticleId;
//!
//! // Ends the run at t = 10.
//! struct TenSeconds;
//! impl Model for TenSeconds {
//!     fn finished(&self, t: f64) -> bool { t >= 10.0 }
//! }
//!
//! // A device that computes nothing but reports its particle count.
//! struct Idle(DeviceIndex);
//! impl DeviceWorker for Idle {
//!     fn device(&self) -> DeviceIndex { self.0 }
//!     fn upload(&mut self, _: &SharedState) -> Result<(), WorkerError> { Ok(()) }
//!     fn execute(&mut self, command: &Command, shared: &SharedState) -> Result<(), WorkerError> {
//!         if command.kind == CommandKind::DownloadNewNumParts {
//!             let owned = shared.device_range(self.0).len();
//!             shared.report(self.0).internal_particles = owned;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut particles = BufferList::new(8);
//! particles.register_all(
//!     BufferKey::Pos | BufferKey::Vel | BufferKey::Info | BufferKey::Hash,
//!     Multiplicity::Single,
//! );
//! for (i, info) in particles.info_mut().unwrap().iter_mut().enumerate() {
//!     *info = ParticleInfo::fluid(ParticleId(i as u32));
//! }
//! let setup = DomainSetup {
//!     grid: Grid::new([0.0; 3], [1.0; 3], [1, 1, 1]).unwrap(),
//!     particles,
//!     device_map: None,
//! };
//! let config = SimulationConfig { capacity: 8, dt: 1.0, ..Default::default() };
//! let mut sim = Simulation::new(config, TenSeconds, setup, Box::new(SingleNode));
//! sim.initialize(vec![Box::new(Idle(DeviceIndex(0)))]).unwrap();
//! let summary = sim.run().unwrap();
//! assert_eq!(summary.iterations, 10);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `hydra-core` | IDs, buffer keys and sets, commands, shared errors |
//! | [`arena`] | `hydra-arena` | Host particle columns and double buffers |
//! | [`partition`] | `hydra-partition` | Grid hashing, device maps, bucket partition |
//! | [`engine`] | `hydra-engine` | Barrier, dispatcher, workers, simulation loop |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identifiers, buffer sets and the command vocabulary (`hydra-core`).
pub use hydra_core as types;

/// Host particle storage (`hydra-arena`).
///
/// [`arena::BufferList`] holds every particle column, single or double
/// buffered, keyed by [`types::BufferKey`].
pub use hydra_arena as arena;

/// Grid hashing and device partitioning (`hydra-partition`).
pub use hydra_partition as partition;

/// Orchestration engine (`hydra-engine`).
///
/// [`engine::Simulation`] runs the loop; [`engine::DeviceWorker`] and
/// [`engine::Model`] are the extension points.
pub use hydra_engine as engine;

/// Common imports for typical Hydra usage.
///
/// ```rust
/// use hydra::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use hydra_core::{
        BufferKey, BufferSet, Command, CommandFlags, CommandKind, DeviceIndex, GlobalDeviceId,
        IntegratorStep, NodeRank,
    };

    // Errors
    pub use hydra_core::{ModelError, SinkError, WorkerError};
    pub use hydra_engine::{ConfigError, RunError};

    // Storage and partitioning
    pub use hydra_arena::BufferList;
    pub use hydra_partition::{DeviceMap, Grid, Topology};

    // Engine
    pub use hydra_engine::{
        DeviceWorker, DomainSetup, Model, OutputSink, Reduction, RunSummary, SharedState,
        Simulation, SimulationConfig, SingleNode, ThreadCluster, WriteRequest, WriteSchedule,
    };
}
