//! Host-memory device workers.
//!
//! [`EmulatedDevice`] keeps its partition in a local [`BufferList`]
//! and implements the commands that move data: hashing, sorting,
//! role swaps, dumps and a forward-Euler position update. Physics
//! commands are accepted and ignored. [`FailingDevice`] wraps one and
//! fails at a chosen point.

use crossbeam_channel::Sender;
use hydra_arena::{ArenaError, BufferList, Column, Multiplicity, Slot};
use hydra_core::{
    BufferKey, BufferSet, Command, CommandKind, DeviceIndex, IntegratorStep, ParticleHash,
    WorkerError,
};
use hydra_engine::{DeviceWorker, SharedState};

/// Channel receiving every command a device executes.
pub type CommandLog = Sender<(DeviceIndex, Command)>;

const DOUBLE: [BufferKey; 11] = [
    BufferKey::Pos,
    BufferKey::Vel,
    BufferKey::Volume,
    BufferKey::Tke,
    BufferKey::Epsilon,
    BufferKey::EulerVel,
    BufferKey::GradGamma,
    BufferKey::Vertices,
    BufferKey::BoundElements,
    BufferKey::InternalEnergy,
    BufferKey::Sigma,
];

const SINGLE: [BufferKey; 2] = [BufferKey::Info, BufferKey::Hash];

/// A device emulated in host memory.
#[derive(Debug)]
pub struct EmulatedDevice {
    device: DeviceIndex,
    list: BufferList,
    dt: f32,
    neighbours: u32,
    body_forces: Vec<[f32; 3]>,
    body_torques: Vec<[f32; 3]>,
    water_depth: Vec<u32>,
    log: Option<CommandLog>,
    executed: u64,
}

impl EmulatedDevice {
    pub fn new(device: DeviceIndex) -> Self {
        Self {
            device,
            list: BufferList::new(0),
            dt: 1e-4,
            neighbours: 32,
            body_forces: Vec::new(),
            body_torques: Vec::new(),
            water_depth: Vec::new(),
            log: None,
            executed: 0,
        }
    }

    /// Timestep reported by every force pass.
    pub fn with_dt(mut self, dt: f32) -> Self {
        self.dt = dt;
        self
    }

    /// Neighbour count reported by every neighbour-list build.
    pub fn with_neighbours(mut self, neighbours: u32) -> Self {
        self.neighbours = neighbours;
        self
    }

    /// Partial body forces and torques reported by `ReduceBodiesForces`.
    pub fn with_body_forces(mut self, forces: Vec<[f32; 3]>, torques: Vec<[f32; 3]>) -> Self {
        self.body_forces = forces;
        self.body_torques = torques;
        self
    }

    /// Water depths reported by `DownloadIoWaterDepth`.
    pub fn with_water_depth(mut self, depth: Vec<u32>) -> Self {
        self.water_depth = depth;
        self
    }

    /// Sends every executed command to `log`.
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = Some(log);
        self
    }

    /// The local particle arrays.
    pub fn particles(&self) -> &BufferList {
        &self.list
    }

    /// Commands executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn fail(&self, command: CommandKind) -> impl Fn(ArenaError) -> WorkerError + '_ {
        move |e| WorkerError::execution(self.device, command, e.to_string())
    }

    fn local_doubles(&self, set: BufferSet) -> BufferSet {
        set.keys_only()
            .iter()
            .filter(|&k| {
                self.list
                    .slot(k)
                    .is_ok_and(|s| s.multiplicity() == Multiplicity::Double)
            })
            .collect()
    }

    fn calc_hash(&mut self, shared: &SharedState) -> Result<(), ArenaError> {
        // Positions were just swapped out, so the current ones are on
        // the WRITE side.
        let pos = match self.list.slot(BufferKey::Pos)? {
            Slot::Double(d) => d.write(),
            Slot::Single(c) => c,
        };
        let pos = pos.as_float4().unwrap_or_default();
        let grid = shared.grid();
        let hashes: Vec<ParticleHash> = pos
            .iter()
            .zip(self.list.info()?)
            .map(|(p, info)| ParticleHash::new(grid.cell_of(*p), info.id))
            .collect();
        self.list.hash_mut()?.copy_from_slice(&hashes);
        Ok(())
    }

    fn sort(&mut self) -> Result<(), ArenaError> {
        let hashes = self.list.hash()?.to_vec();
        let mut order: Vec<usize> = (0..hashes.len()).collect();
        order.sort_by_key(|&i| hashes[i]);

        // at[i]: original index now stored at i; loc[o]: where original o sits.
        let mut at: Vec<usize> = (0..order.len()).collect();
        let mut loc = at.clone();
        for (i, &want) in order.iter().enumerate() {
            let j = loc[want];
            if j != i {
                self.list.swap_elements(i, j);
                at.swap(i, j);
                loc[at[i]] = i;
                loc[at[j]] = j;
            }
        }
        Ok(())
    }

    fn reorder(&mut self) -> Result<(), ArenaError> {
        for key in DOUBLE {
            let d = self.list.double_mut(key)?;
            let (read, write) = d.split();
            write.copy_range_from(key, read, 0..read.len(), 0)?;
        }
        Ok(())
    }

    fn euler(&mut self, command: &Command) -> Result<(), ArenaError> {
        let dt = match command.flags.step() {
            Some(IntegratorStep::Predictor) => command.arg / 2.0,
            _ => command.arg,
        };
        let vel = self.list.vel()?.to_vec();
        let pos = self.list.double_mut(BufferKey::Pos)?;
        let (read, write) = pos.split();
        if let (Some(read), Some(write)) = (read.as_float4(), write.as_float4_mut()) {
            for ((w, r), v) in write.iter_mut().zip(read).zip(&vel) {
                *w = [r[0] + v[0] * dt, r[1] + v[1] * dt, r[2] + v[2] * dt, r[3]];
            }
        }
        let vel = self.list.double_mut(BufferKey::Vel)?;
        let (read, write) = vel.split();
        write.copy_range_from(BufferKey::Vel, read, 0..read.len(), 0)
    }

    fn dump(&self, command: &Command, shared: &SharedState) -> Result<(), WorkerError> {
        let range = shared.device_range(self.device);
        if range.len() != self.list.len() {
            return Err(WorkerError::execution(
                self.device,
                CommandKind::Dump,
                format!(
                    "layout holds {} particles, device holds {}",
                    range.len(),
                    self.list.len()
                ),
            ));
        }
        let keys = command.buffers.keys_only();
        shared
            .host_mut()
            .copy_range_from(&self.list, keys, 0..self.list.len(), range.start)
            .map_err(self.fail(CommandKind::Dump))
    }
}

impl DeviceWorker for EmulatedDevice {
    fn device(&self) -> DeviceIndex {
        self.device
    }

    fn upload(&mut self, shared: &SharedState) -> Result<(), WorkerError> {
        let range = shared.device_range(self.device);
        let mut list = BufferList::new(range.len());
        for key in DOUBLE {
            list.register(key, Multiplicity::Double);
        }
        for key in SINGLE {
            list.register(key, Multiplicity::Single);
        }
        let host = shared.host();
        list.copy_range_from(&host, list.key_set(), range, 0)
            .map_err(|e| WorkerError::Lifecycle {
                device: self.device,
                reason: format!("upload failed: {e}"),
            })?;
        drop(host);
        self.list = list;
        shared.report(self.device).internal_particles = self.list.len();
        Ok(())
    }

    fn execute(&mut self, command: &Command, shared: &SharedState) -> Result<(), WorkerError> {
        self.executed += 1;
        if let Some(log) = &self.log {
            // The receiver may be gone once a test stops listening.
            let _ = log.send((self.device, *command));
        }
        let kind = command.kind;
        match kind {
            CommandKind::SwapBuffers => {
                let set = self.local_doubles(command.buffers);
                self.list.swap_roles(set).map_err(self.fail(kind))?;
            }
            CommandKind::CalcHash => self.calc_hash(shared).map_err(self.fail(kind))?,
            CommandKind::Sort => self.sort().map_err(self.fail(kind))?,
            CommandKind::Reorder => self.reorder().map_err(self.fail(kind))?,
            CommandKind::Euler => self.euler(command).map_err(self.fail(kind))?,
            CommandKind::Dump => self.dump(command, shared)?,
            CommandKind::DownloadNewNumParts => {
                shared.report(self.device).internal_particles = self.list.len();
            }
            CommandKind::ForcesSync | CommandKind::ForcesEnqueue => {
                shared.report(self.device).dt = self.dt;
            }
            CommandKind::BuildNeibs => {
                let mut report = shared.report(self.device);
                report.max_neibs = self.neighbours;
                report.interactions = u64::from(self.neighbours) * self.list.len() as u64;
            }
            CommandKind::ReduceBodiesForces => {
                let mut report = shared.report(self.device);
                report.body_forces = self.body_forces.clone();
                report.body_torques = self.body_torques.clone();
            }
            CommandKind::DownloadIoWaterDepth => {
                shared.report(self.device).water_depth = self.water_depth.clone();
            }
            _ => {}
        }
        Ok(())
    }
}

// ── FailingDevice ───────────────────────────────────────────────────

/// Where a [`FailingDevice`] fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    Initialize,
    Upload,
    /// The `occurrence`-th execution (1-based) of `kind`.
    Command { kind: CommandKind, occurrence: u64 },
    /// Panics on the first execution of `kind`.
    Panic { kind: CommandKind },
}

/// An [`EmulatedDevice`] that fails or panics once at a chosen point.
#[derive(Debug)]
pub struct FailingDevice {
    inner: EmulatedDevice,
    point: FailPoint,
    seen: u64,
}

impl FailingDevice {
    pub fn new(inner: EmulatedDevice, point: FailPoint) -> Self {
        Self {
            inner,
            point,
            seen: 0,
        }
    }
}

impl DeviceWorker for FailingDevice {
    fn device(&self) -> DeviceIndex {
        self.inner.device()
    }

    fn initialize(&mut self, shared: &SharedState) -> Result<(), WorkerError> {
        if self.point == FailPoint::Initialize {
            return Err(WorkerError::Lifecycle {
                device: self.device(),
                reason: "injected initialization failure".into(),
            });
        }
        self.inner.initialize(shared)
    }

    fn upload(&mut self, shared: &SharedState) -> Result<(), WorkerError> {
        if self.point == FailPoint::Upload {
            return Err(WorkerError::Lifecycle {
                device: self.device(),
                reason: "injected upload failure".into(),
            });
        }
        self.inner.upload(shared)
    }

    fn execute(&mut self, command: &Command, shared: &SharedState) -> Result<(), WorkerError> {
        if self.point == (FailPoint::Panic { kind: command.kind }) {
            panic!("device {} lost during {}", self.device(), command.kind.name());
        }
        if let FailPoint::Command { kind, occurrence } = self.point {
            if command.kind == kind {
                self.seen += 1;
                if self.seen == occurrence {
                    return Err(WorkerError::execution(
                        self.device(),
                        kind,
                        "injected failure",
                    ));
                }
            }
        }
        self.inner.execute(command, shared)
    }
}
