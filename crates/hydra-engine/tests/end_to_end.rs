//! Integration test: full runs over emulated devices.
//!
//! Ten thousand particles are split at the midplane between two
//! devices, integrated for twenty iterations and written back. The
//! host arrays must then hold every identity exactly once, sorted by
//! hash within each device, at the analytically advected position.

use std::collections::HashMap;

use crossbeam_channel::unbounded;
use hydra_core::{CommandKind, DeviceIndex, GlobalDeviceId, IntegratorStep, NodeRank};
use hydra_engine::{
    BoundaryModel, DeviceWorker, DomainSetup, RollCall, Simulation, SimulationConfig,
    SimulationFlags, SingleNode, SphFormulation, ViscosityModel, WriteSchedule,
};
use hydra_partition::{DeviceMap, Grid};
use hydra_test_utils::{
    emulated_devices, init_tracing, particle_cloud, unit_grid, EmulatedDevice, RecordingSink,
    ScriptedModel,
};

const N: usize = 10_000;
const DT: f32 = 1e-4;
const ITERATIONS: u64 = 20;

fn midplane_map(grid: &Grid) -> DeviceMap {
    DeviceMap::from_fn(grid, |c| {
        let device = if c[0] < 4 { 0 } else { 1 };
        GlobalDeviceId::new(NodeRank::COORDINATOR, DeviceIndex(device))
    })
}

#[test]
fn midplane_split_round_trips_every_particle() {
    init_tracing();
    let grid = unit_grid([8, 8, 8]);
    let particles = particle_cloud(N, 2024, [0.0; 3], [1.0; 3]);
    let initial: HashMap<u32, ([f32; 4], [f32; 4])> = particles
        .info()
        .unwrap()
        .iter()
        .zip(particles.pos().unwrap())
        .zip(particles.vel().unwrap())
        .map(|((info, pos), vel)| (info.id.0, (*pos, *vel)))
        .collect();
    let left = particles.pos().unwrap().iter().filter(|p| p[0] < 0.5).count();

    let config = SimulationConfig {
        devices: 2,
        capacity: N,
        max_iterations: ITERATIONS,
        dt: DT,
        ..SimulationConfig::default()
    };
    let setup = DomainSetup {
        device_map: Some(midplane_map(&grid)),
        grid,
        particles,
    };
    let mut sim = Simulation::new(config, ScriptedModel::endless(), setup, Box::new(SingleNode));
    let sink = RecordingSink::new("frames", WriteSchedule::every(5.0 * f64::from(DT)));
    let records = sink.records();
    sim.add_sink(Box::new(sink));

    sim.initialize(emulated_devices(2, DT, None)).unwrap();

    let layout = sim.shared().unwrap().layout();
    assert_eq!(layout.counts.as_slice(), &[left, N - left]);
    assert_eq!(layout.starts.as_slice(), &[0, left]);
    assert_eq!(layout.total, N);

    let summary = sim.run().unwrap();
    assert_eq!(summary.iterations, ITERATIONS);
    assert_eq!(summary.particles, N);
    assert_eq!(summary.roll_call_anomalies, 0);
    assert!(summary.peak_speed.speed > 0.0);
    assert!(summary.peak_speed.speed <= 3f64.sqrt());

    let shared = sim.shared().unwrap();
    let host = shared.host();
    let report = RollCall::new().check(host.info().unwrap(), &shared.layout(), N);
    assert!(report.is_clean(), "{report:?}");

    let hashes = host.hash().unwrap();
    for d in 0..2 {
        let range = shared.device_range(DeviceIndex(d));
        assert!(hashes[range].windows(2).all(|w| w[0] <= w[1]));
    }

    let elapsed = ITERATIONS as f32 * DT;
    for (info, pos) in host.info().unwrap().iter().zip(host.pos().unwrap()) {
        let (p0, v) = initial[&info.id.0];
        for k in 0..3 {
            let expected = p0[k] + v[k] * elapsed;
            assert!(
                (pos[k] - expected).abs() < 1e-5,
                "particle {} axis {k}: {} != {expected}",
                info.id,
                pos[k]
            );
        }
    }

    let records = RecordingSink::snapshot(&records);
    let iterations: Vec<u64> = records.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![0, 5, 10, 15, 20]);
    let mut ids = records.last().unwrap().ids.clone();
    ids.sort_unstable();
    assert_eq!(ids, (0..N as u32).collect::<Vec<_>>());
}

#[test]
fn semi_analytical_open_boundary_run_with_bodies() {
    init_tracing();
    let (tx, rx) = unbounded();
    let config = SimulationConfig {
        devices: 2,
        capacity: 1000,
        max_iterations: 2,
        dt: DT,
        boundary: BoundaryModel::SemiAnalytical,
        boundary_engine: true,
        formulation: SphFormulation::Grenier,
        viscosity: ViscosityModel::Sps,
        flags: SimulationFlags {
            inlet_outlet: true,
            water_depth: true,
            density_sum: true,
            ..SimulationFlags::default()
        },
        ..SimulationConfig::default()
    };
    let setup = DomainSetup {
        grid: unit_grid([4, 4, 4]),
        particles: particle_cloud(400, 5, [0.0; 3], [1.0; 3]),
        device_map: None,
    };
    let model = ScriptedModel::endless()
        .with_bodies(2, 1)
        .with_gravity(|t| [0.0, 0.0, -9.81 * (1.0 + t as f32)]);
    let mut sim = Simulation::new(config, model, setup, Box::new(SingleNode));

    let partials = [([1.0, 0.0, 0.0], vec![3, 7]), ([2.0, 0.0, 0.5], vec![5, 1])];
    let workers: Vec<Box<dyn DeviceWorker>> = partials
        .iter()
        .enumerate()
        .map(|(d, (force, depth))| {
            let device = EmulatedDevice::new(DeviceIndex(d as u8))
                .with_dt(DT)
                .with_body_forces(vec![*force], vec![[0.0; 3]])
                .with_water_depth(depth.clone())
                .with_log(tx.clone());
            Box::new(device) as Box<dyn DeviceWorker>
        })
        .collect();
    drop(tx);
    sim.initialize(workers).unwrap();
    let summary = sim.run().unwrap();
    assert_eq!(summary.iterations, 2);

    let log: Vec<_> = rx.try_iter().collect();
    let device0 = |kind: CommandKind| {
        log.iter()
            .filter(|(d, c)| *d == DeviceIndex(0) && c.kind == kind)
            .count()
    };
    assert_eq!(device0(CommandKind::IdentifyCornerVertices), 1);
    assert_eq!(device0(CommandKind::InitGamma), 1);
    assert_eq!(device0(CommandKind::InitIoMass), 1);
    assert_eq!(device0(CommandKind::DisableOutgoingParts), 2);
    assert_eq!(device0(CommandKind::DownloadIoWaterDepth), 5);
    assert_eq!(device0(CommandKind::ComputeDensity), 4);
    assert_eq!(device0(CommandKind::Sps), 4);
    assert_eq!(device0(CommandKind::ReduceBodiesForces), 4);
    assert_eq!(device0(CommandKind::EulerUploadObjectsCg), 2);
    assert_eq!(device0(CommandKind::UploadGravity), 4);

    let shared = sim.shared().unwrap();
    assert_eq!(shared.water_depth(), vec![5, 7]);
    assert_eq!(shared.bodies().len(), 2);
    let (forces, _) = sim.applied_body_forces();
    assert_eq!(forces, &[[3.0, 0.0, 0.5]]);

    let calls = sim.model().calls();
    assert!(calls.initialized);
    assert_eq!(calls.gravity.len(), 4);
    assert_eq!(calls.bodies_forces.len(), 4);
    let (t0, t1, step, f) = &calls.bodies_forces[0];
    assert_eq!(*t0, 0.0);
    assert_eq!(*t1, f64::from(DT) / 2.0);
    assert_eq!(*step, IntegratorStep::Predictor);
    assert_eq!(f, &vec![[3.0, 0.0, 0.5]]);
    assert_eq!(calls.post_timestep.len(), 2);
    assert_eq!(sim.created_iterations(), 0);
}
