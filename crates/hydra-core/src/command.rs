//! The command record posted to device workers.
//!
//! Exactly one [`Command`] is in flight at a time. The orchestrator
//! writes it between barriers; every worker reads it during the
//! execution window that follows.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::buffer::BufferSet;

/// Every operation a device worker can be asked to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// No-op. The posted state before the first real command.
    Idle,
    /// Leave the command loop and finalize.
    Quit,
    /// Recompute particle hashes from positions.
    CalcHash,
    /// Sort particles by hash on the device.
    Sort,
    /// Reorder all per-particle buffers after a sort.
    Reorder,
    /// Read back the number of particles after creation or deletion.
    DownloadNewNumParts,
    /// Push the reconciled particle count to the device.
    UploadNewNumParts,
    /// Swap READ/WRITE roles of the selected double buffers.
    SwapBuffers,
    /// Download cell start/end tables for halo bookkeeping.
    DumpCells,
    /// Recompute inner/edge cell segments.
    UpdateSegments,
    /// Drop external (halo) particles.
    Crop,
    /// Append halo particles from neighbouring devices.
    AppendExternal,
    /// Build the neighbour list.
    BuildNeibs,
    /// Compute forces in one synchronous pass.
    ForcesSync,
    /// Start the striped force computation on inner edge cells.
    ForcesEnqueue,
    /// Finish the striped force computation.
    ForcesComplete,
    /// Refresh halo copies of the selected buffers.
    UpdateExternal,
    /// Integrate positions and velocities.
    Euler,
    /// Run a density filter. The argument selects the filter.
    Filter,
    /// Run a post-processing pass. The argument selects the pass.
    PostProcess,
    /// Upload the current gravity vector.
    UploadGravity,
    /// Copy the selected buffers from device to host.
    Dump,
    /// Sub-particle scale turbulence pass.
    Sps,
    /// Grenier density recomputation.
    ComputeDensity,
    /// Reduce per-body forces on each device.
    ReduceBodiesForces,
    /// Upload body rotation matrices and translations.
    UploadObjectsMatrices,
    /// Upload body linear and angular velocities.
    UploadObjectsVelocities,
    /// Upload centres of gravity before the force pass.
    ForcesUploadObjectsCg,
    /// Upload centres of gravity before integration.
    EulerUploadObjectsCg,
    /// Flag vertices at domain corners.
    IdentifyCornerVertices,
    /// Count vertices for open-boundary mass initialization.
    InitIoMassVertexCount,
    /// Initialize open-boundary vertex mass.
    InitIoMass,
    /// Initialize the boundary gamma field.
    InitGamma,
    /// Semi-analytical boundary conditions on segments.
    SaCalcSegmentBoundaryConditions,
    /// Semi-analytical boundary conditions on vertices.
    SaCalcVertexBoundaryConditions,
    /// Impose prescribed open-boundary values.
    ImposeOpenBoundaryCondition,
    /// Mark particles that left through an outlet.
    DisableOutgoingParts,
    /// Download per-boundary water depth.
    DownloadIoWaterDepth,
    /// Upload the reduced water depth.
    UploadIoWaterDepth,
}

impl CommandKind {
    /// Stable display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Quit => "QUIT",
            Self::CalcHash => "CALCHASH",
            Self::Sort => "SORT",
            Self::Reorder => "REORDER",
            Self::DownloadNewNumParts => "DOWNLOAD_NEWNUMPARTS",
            Self::UploadNewNumParts => "UPLOAD_NEWNUMPARTS",
            Self::SwapBuffers => "SWAP_BUFFERS",
            Self::DumpCells => "DUMP_CELLS",
            Self::UpdateSegments => "UPDATE_SEGMENTS",
            Self::Crop => "CROP",
            Self::AppendExternal => "APPEND_EXTERNAL",
            Self::BuildNeibs => "BUILDNEIBS",
            Self::ForcesSync => "FORCES_SYNC",
            Self::ForcesEnqueue => "FORCES_ENQUEUE",
            Self::ForcesComplete => "FORCES_COMPLETE",
            Self::UpdateExternal => "UPDATE_EXTERNAL",
            Self::Euler => "EULER",
            Self::Filter => "FILTER",
            Self::PostProcess => "POSTPROCESS",
            Self::UploadGravity => "UPLOAD_GRAVITY",
            Self::Dump => "DUMP",
            Self::Sps => "SPS",
            Self::ComputeDensity => "COMPUTE_DENSITY",
            Self::ReduceBodiesForces => "REDUCE_BODIES_FORCES",
            Self::UploadObjectsMatrices => "UPLOAD_OBJECTS_MATRICES",
            Self::UploadObjectsVelocities => "UPLOAD_OBJECTS_VELOCITIES",
            Self::ForcesUploadObjectsCg => "FORCES_UPLOAD_OBJECTS_CG",
            Self::EulerUploadObjectsCg => "EULER_UPLOAD_OBJECTS_CG",
            Self::IdentifyCornerVertices => "IDENTIFY_CORNER_VERTICES",
            Self::InitIoMassVertexCount => "INIT_IO_MASS_VERTEX_COUNT",
            Self::InitIoMass => "INIT_IO_MASS",
            Self::InitGamma => "INIT_GAMMA",
            Self::SaCalcSegmentBoundaryConditions => "SA_CALC_SEGMENT_BOUNDARY_CONDITIONS",
            Self::SaCalcVertexBoundaryConditions => "SA_CALC_VERTEX_BOUNDARY_CONDITIONS",
            Self::ImposeOpenBoundaryCondition => "IMPOSE_OPEN_BOUNDARY_CONDITION",
            Self::DisableOutgoingParts => "DISABLE_OUTGOING_PARTS",
            Self::DownloadIoWaterDepth => "DOWNLOAD_IOWATERDEPTH",
            Self::UploadIoWaterDepth => "UPLOAD_IOWATERDEPTH",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which half of the predictor/corrector scheme a command belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntegratorStep {
    /// First stage, advancing to `t + dt/2`.
    Predictor = 1,
    /// Second stage, advancing to `t + dt`.
    Corrector = 2,
}

impl IntegratorStep {
    /// The matching command flag.
    pub fn flag(self) -> CommandFlags {
        match self {
            Self::Predictor => CommandFlags::INTEGRATOR_STEP_1,
            Self::Corrector => CommandFlags::INTEGRATOR_STEP_2,
        }
    }

    /// The stage number, 1 or 2.
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// Behaviour flags attached to a command.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags(u32);

impl CommandFlags {
    /// No flags.
    pub const NONE: CommandFlags = CommandFlags(0);
    /// Predictor stage.
    pub const INTEGRATOR_STEP_1: CommandFlags = CommandFlags(1 << 0);
    /// Corrector stage.
    pub const INTEGRATOR_STEP_2: CommandFlags = CommandFlags(1 << 1);
    /// Issued during setup, before the first iteration.
    pub const INITIALIZATION_STEP: CommandFlags = CommandFlags(1 << 2);
    /// A write that follows a completed corrector stage.
    pub const ALL_INTEGRATION_STEPS: CommandFlags = CommandFlags(1 << 3);
    /// Restrict the command to locally-owned particles.
    pub const ONLY_INTERNAL: CommandFlags = CommandFlags(1 << 4);

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The integrator stage, if one of the stage flags is set.
    pub fn step(self) -> Option<IntegratorStep> {
        if self.contains(Self::INTEGRATOR_STEP_1) {
            Some(IntegratorStep::Predictor)
        } else if self.contains(Self::INTEGRATOR_STEP_2) {
            Some(IntegratorStep::Corrector)
        } else {
            None
        }
    }
}

impl BitOr for CommandFlags {
    type Output = CommandFlags;

    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommandFlags {
    fn bitor_assign(&mut self, rhs: CommandFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CommandFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CommandFlags, &str); 5] = [
            (CommandFlags::INTEGRATOR_STEP_1, "STEP_1"),
            (CommandFlags::INTEGRATOR_STEP_2, "STEP_2"),
            (CommandFlags::INITIALIZATION_STEP, "INIT"),
            (CommandFlags::ALL_INTEGRATION_STEPS, "ALL_STEPS"),
            (CommandFlags::ONLY_INTERNAL, "ONLY_INTERNAL"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// One posted command: what to run, on which buffers, with which flags.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Command {
    /// The operation.
    pub kind: CommandKind,
    /// Target buffers and READ/WRITE selector.
    pub buffers: BufferSet,
    /// Behaviour flags.
    pub flags: CommandFlags,
    /// Scalar argument, command-specific (dt, filter index, ...).
    pub arg: f32,
}

impl Command {
    /// A command with no buffers, no flags and a zero argument.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            buffers: BufferSet::empty(),
            flags: CommandFlags::NONE,
            arg: 0.0,
        }
    }

    /// The initial posted state.
    pub fn idle() -> Self {
        Self::new(CommandKind::Idle)
    }

    /// Builder: set target buffers.
    pub fn on(mut self, buffers: impl Into<BufferSet>) -> Self {
        self.buffers = buffers.into();
        self
    }

    /// Builder: add flags.
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Builder: set the scalar argument.
    pub fn with_arg(mut self, arg: f32) -> Self {
        self.arg = arg;
        self
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::idle()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.buffers.is_empty() {
            write!(f, " {:?}", self.buffers)?;
        }
        if self.flags != CommandFlags::NONE {
            write!(f, " [{:?}]", self.flags)?;
        }
        Ok(())
    }
}
