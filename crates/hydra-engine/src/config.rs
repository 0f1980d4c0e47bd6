//! Run configuration, validation and restart metadata.
//!
//! [`SimulationConfig`] collects every knob the simulation loop reads.
//! [`validate()`](SimulationConfig::validate) checks structural
//! invariants before any worker thread is spawned.

use std::path::{Path, PathBuf};

use hydra_core::{BufferSet, GlobalDeviceId, NodeRank};
use hydra_partition::Topology;
use thiserror::Error;

// ── Model selectors ─────────────────────────────────────────────────

/// SPH formulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SphFormulation {
    /// Single-fluid formulation.
    #[default]
    Standard,
    /// Grenier multi-fluid formulation, which recomputes density and
    /// volume before forces.
    Grenier,
}

/// Viscosity and turbulence model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ViscosityModel {
    /// Laminar viscosity.
    #[default]
    Laminar,
    /// Sub-particle scale turbulence.
    Sps,
    /// k-epsilon turbulence.
    KEpsilon,
}

/// Boundary treatment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BoundaryModel {
    /// Lennard-Jones repulsive boundaries.
    #[default]
    LennardJones,
    /// Dynamic boundary particles.
    Dynamic,
    /// Semi-analytical boundaries. Requires a boundary-condition engine.
    SemiAnalytical,
}

/// Feature switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimulationFlags {
    /// Recompute dt every iteration from the devices' reports.
    pub adaptive_dt: bool,
    /// Open boundaries that create and destroy particles.
    pub inlet_outlet: bool,
    /// Density by summation, which integrates internal particles only.
    pub density_sum: bool,
    /// Track water depth at open boundaries.
    pub water_depth: bool,
    /// Integrate internal energy.
    pub internal_energy: bool,
}

/// A periodic density filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterSpec {
    /// Filter identifier, passed as the command argument.
    pub kind: u32,
    /// Run every `frequency` iterations.
    pub frequency: u64,
}

/// A post-processing pass run before each save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostProcessSpec {
    /// Pass identifier, passed as the command argument.
    pub kind: u32,
    /// Buffers the pass updates in place.
    pub updated: BufferSet,
    /// Buffers the pass writes to their WRITE side.
    pub written: BufferSet,
}

/// State recovered from a hot-start file.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeState {
    /// Path of the first hot-start file.
    pub file: PathBuf,
    /// Simulation time.
    pub t: f64,
    /// Completed iterations.
    pub iteration: u64,
    /// Timestep.
    pub dt: f32,
}

// ── HotStartName ────────────────────────────────────────────────────

/// Parsed hot-start file name.
///
/// Multi-node hot-start files are named `hot_nX.Y_Z.bin`, where `X`
/// is the writing rank, `Y` the number of ranks that took part and
/// `Z` the checkpoint index. Any other name is a single-file restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotStartName {
    dir: PathBuf,
    /// Number of ranks that wrote the checkpoint.
    pub ranks: usize,
    suffix: Option<String>,
    file: String,
}

impl HotStartName {
    const PREFIX: &'static str = "hot_n";

    /// Parses `path`.
    pub fn parse(path: &Path) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::MalformedRestart {
            name: path.display().to_string(),
        };
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(malformed)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !file.starts_with(Self::PREFIX) {
            return Ok(Self {
                dir,
                ranks: 1,
                suffix: None,
                file: file.to_owned(),
            });
        }
        let dot = file.find('.').ok_or_else(malformed)?;
        let underscore = file[Self::PREFIX.len()..]
            .find('_')
            .map(|i| i + Self::PREFIX.len())
            .ok_or_else(malformed)?;
        if dot >= underscore {
            return Err(malformed());
        }
        let ranks: usize = file[dot + 1..underscore].parse().map_err(|_| malformed())?;
        if ranks == 0 {
            return Err(malformed());
        }
        Ok(Self {
            dir,
            ranks,
            suffix: Some(file[dot..].to_owned()),
            file: file.to_owned(),
        })
    }

    /// Path of the file written by each rank, in rank order.
    pub fn files(&self) -> Vec<PathBuf> {
        match &self.suffix {
            None => vec![self.dir.join(&self.file)],
            Some(suffix) => (0..self.ranks)
                .map(|r| self.dir.join(format!("{}{r}{suffix}", Self::PREFIX)))
                .collect(),
        }
    }
}

// ── ConfigError ─────────────────────────────────────────────────────

/// Errors detected by [`SimulationConfig::validate()`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// No local devices.
    #[error("at least one device is required")]
    NoDevices,
    /// More local devices than a node can address.
    #[error("{devices} devices exceed the per-node maximum of {max}")]
    TooManyDevices {
        /// Requested devices.
        devices: usize,
        /// Addressable devices per node.
        max: usize,
    },
    /// The node layout is inconsistent.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Human-readable cause.
        reason: String,
    },
    /// Neighbour lists would never be rebuilt.
    #[error("neighbour list rebuild frequency must be positive")]
    ZeroRebuildFrequency,
    /// A filter would never run.
    #[error("filter {kind} has zero frequency")]
    ZeroFilterFrequency {
        /// The filter identifier.
        kind: u32,
    },
    /// dt is NaN, infinite, zero or negative.
    #[error("invalid timestep {value}")]
    InvalidDt {
        /// The rejected value.
        value: f32,
    },
    /// The allocation cannot hold the initial particles.
    #[error("capacity {capacity} is below the {particles} initial particles")]
    CapacityTooSmall {
        /// Allocated capacity.
        capacity: usize,
        /// Initial particle count.
        particles: usize,
    },
    /// The hot-start metadata cannot be parsed.
    #[error("malformed restart metadata: {name}")]
    MalformedRestart {
        /// The offending file name or field.
        name: String,
    },
}

// ── SimulationConfig ────────────────────────────────────────────────

/// Everything the simulation loop needs besides the collaborators.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Devices driven by this node.
    pub devices: usize,
    /// This node's rank.
    pub rank: NodeRank,
    /// Devices per node for multi-node runs. Empty means a single node
    /// with [`devices`](Self::devices) devices.
    pub devices_per_node: Vec<usize>,
    /// Rebuild neighbour lists every this many iterations. Default: 10.
    pub buildneibs_freq: u64,
    /// Periodic density filters.
    pub filters: Vec<FilterSpec>,
    /// Passes run before each save.
    pub post_processes: Vec<PostProcessSpec>,
    /// Feature switches.
    pub flags: SimulationFlags,
    /// SPH formulation.
    pub formulation: SphFormulation,
    /// Viscosity model.
    pub viscosity: ViscosityModel,
    /// Boundary model.
    pub boundary: BoundaryModel,
    /// Whether a semi-analytical boundary-condition engine is linked in.
    pub boundary_engine: bool,
    /// Overlap force computation with halo exchange.
    pub striping: bool,
    /// Stop after this many iterations. Zero means no cap.
    pub max_iterations: u64,
    /// Initial timestep.
    pub dt: f32,
    /// Particles the devices can hold.
    pub capacity: usize,
    /// Skip writes that are merely due; forced writes still happen.
    pub nosave: bool,
    /// Do not warn when the particle count shrinks.
    pub no_leak_warning: bool,
    /// Save particles before each force computation.
    pub inspect_preforce: bool,
    /// Dump the neighbour list with every save.
    pub debug_neibs: bool,
    /// Dump forces with every save.
    pub debug_forces: bool,
    /// Neighbour count above which a warning is logged. Default: 128.
    pub max_neibs: u32,
    /// Restart metadata, if resuming.
    pub resume: Option<ResumeState>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            rank: NodeRank::COORDINATOR,
            devices_per_node: Vec::new(),
            buildneibs_freq: 10,
            filters: Vec::new(),
            post_processes: Vec::new(),
            flags: SimulationFlags::default(),
            formulation: SphFormulation::default(),
            viscosity: ViscosityModel::default(),
            boundary: BoundaryModel::default(),
            boundary_engine: false,
            striping: false,
            max_iterations: 0,
            dt: 1e-4,
            capacity: 0,
            nosave: false,
            no_leak_warning: false,
            inspect_preforce: false,
            debug_neibs: false,
            debug_forces: false,
            max_neibs: 128,
            resume: None,
        }
    }
}

impl SimulationConfig {
    /// Checks the configuration against the initial particle count.
    pub fn validate(&self, particles: usize) -> Result<(), ConfigError> {
        if self.devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        if self.devices > GlobalDeviceId::MAX_DEVICES_PER_NODE {
            return Err(ConfigError::TooManyDevices {
                devices: self.devices,
                max: GlobalDeviceId::MAX_DEVICES_PER_NODE,
            });
        }
        self.topology()?;
        if self.buildneibs_freq == 0 {
            return Err(ConfigError::ZeroRebuildFrequency);
        }
        if let Some(f) = self.filters.iter().find(|f| f.frequency == 0) {
            return Err(ConfigError::ZeroFilterFrequency { kind: f.kind });
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ConfigError::InvalidDt { value: self.dt });
        }
        if self.capacity < particles {
            return Err(ConfigError::CapacityTooSmall {
                capacity: self.capacity,
                particles,
            });
        }
        if let Some(resume) = &self.resume {
            HotStartName::parse(&resume.file)?;
            if !resume.t.is_finite() {
                return Err(ConfigError::MalformedRestart {
                    name: format!("t = {}", resume.t),
                });
            }
            if !(resume.dt.is_finite() && resume.dt > 0.0) {
                return Err(ConfigError::MalformedRestart {
                    name: format!("dt = {}", resume.dt),
                });
            }
        }
        Ok(())
    }

    /// The node and device layout described by this configuration.
    pub fn topology(&self) -> Result<Topology, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTopology { reason };
        if self.devices_per_node.is_empty() {
            return Topology::single_node(self.devices).map_err(|e| invalid(e.to_string()));
        }
        let ours = self.devices_per_node.get(self.rank.as_usize()).copied();
        if ours != Some(self.devices) {
            return Err(invalid(format!(
                "rank {} drives {} devices but the node layout says {ours:?}",
                self.rank, self.devices
            )));
        }
        Topology::new(self.rank, &self.devices_per_node).map_err(|e| invalid(e.to_string()))
    }

    /// Whether the semi-analytical boundary model is active.
    pub fn semi_analytical(&self) -> bool {
        self.boundary == BoundaryModel::SemiAnalytical
    }
}
