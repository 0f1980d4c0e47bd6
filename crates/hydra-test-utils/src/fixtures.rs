//! Deterministic particle fixtures.

use hydra_arena::{BufferList, Multiplicity, ParticleInfo};
use hydra_core::{BufferKey, DeviceIndex, ParticleId};
use hydra_engine::DeviceWorker;
use hydra_partition::Grid;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::device::{CommandLog, EmulatedDevice};

/// `n` fluid particles uniformly placed in the box `lo..hi`, with unit
/// mass, identities `0..n` and velocities in `[-1, 1)` per component.
///
/// Registers `Pos`, `Vel`, `Info` and `Hash`, single-buffered.
pub fn particle_cloud(n: usize, seed: u64, lo: [f32; 3], hi: [f32; 3]) -> BufferList {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut list = BufferList::new(n);
    for key in [BufferKey::Pos, BufferKey::Vel, BufferKey::Info, BufferKey::Hash] {
        list.register(key, Multiplicity::Single);
    }
    let pos: Vec<[f32; 4]> = (0..n)
        .map(|_| {
            let mut p = [0.0, 0.0, 0.0, 1.0];
            for k in 0..3 {
                p[k] = lo[k] + rng.random::<f32>() * (hi[k] - lo[k]);
            }
            p
        })
        .collect();
    let vel: Vec<[f32; 4]> = (0..n)
        .map(|_| {
            [
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                1000.0,
            ]
        })
        .collect();
    list.pos_mut().expect("pos registered").copy_from_slice(&pos);
    list.vel_mut().expect("vel registered").copy_from_slice(&vel);
    for (i, info) in list.info_mut().expect("info registered").iter_mut().enumerate() {
        *info = ParticleInfo::fluid(ParticleId(i as u32));
    }
    list
}

/// Grid covering the unit cube with `cells` cells per axis.
pub fn unit_grid(cells: [u32; 3]) -> Grid {
    let size = cells.map(|c| 1.0 / f64::from(c.max(1)));
    Grid::new([0.0; 3], size, cells).expect("valid unit grid")
}

/// One [`EmulatedDevice`] per local device, all reporting `dt`.
pub fn emulated_devices(
    devices: usize,
    dt: f32,
    log: Option<CommandLog>,
) -> Vec<Box<dyn DeviceWorker>> {
    (0..devices)
        .map(|d| {
            let mut device = EmulatedDevice::new(DeviceIndex(d as u8)).with_dt(dt);
            if let Some(log) = &log {
                device = device.with_log(log.clone());
            }
            Box::new(device) as Box<dyn DeviceWorker>
        })
        .collect()
}

/// Routes engine logs to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
