//! Benchmark profiles for the Hydra orchestration core.
//!
//! - [`reference_profile`]: 100K particles on a 32x8x8 grid, four devices
//! - [`stress_profile`]: 1M particles on a 64x16x16 grid, eight devices
//! - [`run_reference`]: a complete run over emulated devices

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use hydra_arena::BufferList;
use hydra_engine::{DomainSetup, RunError, RunSummary, Simulation, SimulationConfig, SingleNode};
use hydra_partition::{Grid, PartitionError, Topology};
use hydra_test_utils::{emulated_devices, particle_cloud, unit_grid, ScriptedModel};

/// A hashed particle cloud and the topology it is split across.
pub struct PartitionProfile {
    /// Grid covering the unit cube.
    pub grid: Grid,
    /// Particles with their `Hash` column filled.
    pub particles: BufferList,
    /// Single-node topology.
    pub topology: Topology,
}

fn profile(
    particles: usize,
    cells: [u32; 3],
    devices: usize,
    seed: u64,
) -> Result<PartitionProfile, PartitionError> {
    let grid = unit_grid(cells);
    let mut list = particle_cloud(particles, seed, [0.0; 3], [1.0; 3]);
    grid.hash_particles(&mut list)?;
    Ok(PartitionProfile {
        grid,
        particles: list,
        topology: Topology::single_node(devices)?,
    })
}

/// 100K particles, 32x8x8 cells, four devices.
pub fn reference_profile(seed: u64) -> Result<PartitionProfile, PartitionError> {
    profile(100_000, [32, 8, 8], 4, seed)
}

/// 1M particles, 64x16x16 cells, eight devices.
pub fn stress_profile(seed: u64) -> Result<PartitionProfile, PartitionError> {
    profile(1_000_000, [64, 16, 16], 8, seed)
}

/// Runs `iterations` iterations of `particles` particles over
/// `devices` emulated devices.
pub fn run_reference(
    particles: usize,
    devices: usize,
    iterations: u64,
    seed: u64,
) -> Result<RunSummary, RunError> {
    let config = SimulationConfig {
        devices,
        capacity: particles,
        max_iterations: iterations,
        dt: 1e-4,
        ..SimulationConfig::default()
    };
    let setup = DomainSetup {
        grid: unit_grid([32, 8, 8]),
        particles: particle_cloud(particles, seed, [0.0; 3], [1.0; 3]),
        device_map: None,
    };
    let mut sim = Simulation::new(config, ScriptedModel::endless(), setup, Box::new(SingleNode));
    sim.initialize(emulated_devices(devices, 1e-4, None))?;
    sim.run()
}
