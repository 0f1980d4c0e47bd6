//! Error types of the orchestration engine.

use hydra_arena::ArenaError;
use hydra_core::{CommandKind, ModelError, SinkError, WorkerError};
use hydra_partition::PartitionError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::simulation::RunState;

/// A command could not be completed by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A worker cleared the liveness flag while executing `command`.
    #[error("run aborted while executing {command}")]
    Aborted {
        /// The command that was in flight.
        command: CommandKind,
    },
    /// The synchronizer was force-unlocked during the handshake.
    #[error("synchronizer unlocked while dispatching {command}")]
    Unlocked {
        /// The command that was in flight.
        command: CommandKind,
    },
    /// Liveness was already lost; `command` was never posted.
    #[error("refusing to post {command}: the run is no longer live")]
    NotRunning {
        /// The refused command.
        command: CommandKind,
    },
}

/// A multi-node collective failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReductionError {
    /// Another rank abandoned the collective.
    #[error("cluster unlocked during a collective")]
    Unlocked,
    /// Ranks contributed vectors of different lengths.
    #[error("rank {rank} contributed {actual} values, expected {expected}")]
    LengthMismatch {
        /// The offending rank.
        rank: usize,
        /// Length contributed by the local node.
        expected: usize,
        /// Length contributed by `rank`.
        actual: usize,
    },
    /// The transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Top-level error of a simulation run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid configuration or restart metadata.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Domain decomposition failed.
    #[error(transparent)]
    Partition(#[from] PartitionError),
    /// Host buffer bookkeeping failed.
    #[error(transparent)]
    Arena(#[from] ArenaError),
    /// A command was aborted.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A device worker failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// The model rejected a callback.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// An output sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// A multi-node collective failed.
    #[error(transparent)]
    Reduction(#[from] ReductionError),
    /// More particles than the allocated capacity.
    #[error("{particles} particles exceed the allocated capacity of {capacity}")]
    CapacityExceeded {
        /// Particles on this node.
        particles: usize,
        /// Allocated capacity.
        capacity: usize,
    },
    /// The clock did not leave zero after an iteration.
    #[error("timestep is zero at iteration {iteration}")]
    DtZero {
        /// Iteration that produced the zero step.
        iteration: u64,
    },
    /// Semi-analytical boundaries were requested without a boundary engine.
    #[error("semi-analytical boundaries require a boundary-condition engine")]
    MissingBoundaryEngine,
    /// The number of supplied workers does not match the local devices.
    #[error("expected {expected} device workers, got {actual}")]
    WorkerCount {
        /// Local device count.
        expected: usize,
        /// Workers supplied.
        actual: usize,
    },
    /// Workers failed during initialization without a recorded cause.
    #[error("device workers failed to initialize")]
    InitializationFailed,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// An operation was called in the wrong run state.
    #[error("operation requires state {expected:?}, simulation is {actual:?}")]
    InvalidState {
        /// Required state.
        expected: RunState,
        /// Current state.
        actual: RunState,
    },
}
