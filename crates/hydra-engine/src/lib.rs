//! Orchestration engine for Hydra multi-device particle simulations.
//!
//! One long-lived worker thread drives each compute device. The
//! orchestrator thread posts a [`Command`](hydra_core::Command) into
//! the [`SharedState`] and releases the workers through a two-barrier
//! handshake on the [`Synchronizer`]; the barrier is the only
//! coordination primitive between them. The [`Simulation`] state
//! machine sequences neighbour-list rebuilds, the predictor/corrector
//! integration stages, timestep selection, termination and writes.
//!
//! Multi-node runs reconcile counts and reduce timesteps through the
//! [`Reduction`] trait, implemented here for a single node and for an
//! in-process cluster of threads.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod barrier;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod indices;
pub mod metrics;
pub mod model;
pub mod reduction;
pub mod rollcall;
pub mod shared;
pub mod simulation;
pub mod worker;
pub mod writer;

pub use barrier::{BarrierOutcome, Synchronizer};
pub use config::{
    BoundaryModel, ConfigError, FilterSpec, HotStartName, PostProcessSpec, ResumeState,
    SimulationConfig, SimulationFlags, SphFormulation, ViscosityModel,
};
pub use dispatch::CommandDispatcher;
pub use error::{DispatchError, ReductionError, RunError};
pub use metrics::{IppsCounter, PeakSpeed};
pub use model::{BodyCounts, BodyKinematics, Model};
pub use reduction::{ReduceOp, Reduction, SingleNode, ThreadCluster};
pub use rollcall::{RollCall, RollCallReport};
pub use shared::{Clock, DeviceLayout, DeviceReport, SharedState, Window};
pub use simulation::{DomainSetup, RunState, RunSummary, Simulation};
pub use worker::{DeviceWorker, WorkerExit, WorkerHandle};
pub use writer::{DueSinks, OutputSink, SinkSet, WriteRequest, WriteSchedule};
