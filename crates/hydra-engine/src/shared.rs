//! State shared by the orchestrator and the device workers.
//!
//! The [`SharedState`] is passed explicitly as an `Arc` to every
//! participant. Ownership of its fields alternates between two
//! windows delimited by the [`Synchronizer`](crate::Synchronizer):
//!
//! - [`Window::Orchestrator`]: the orchestrator posts the next command
//!   and updates clock, layout, gravity and body state. Workers are
//!   parked on a barrier.
//! - [`Window::Workers`]: every worker reads the posted command and
//!   writes its own [`DeviceReport`]. The orchestrator is parked.
//!
//! The locks below exist for memory safety only; they are never
//! contended for coordination. Debug builds check that orchestrator
//! writes happen in the orchestrator window.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hydra_arena::BufferList;
use hydra_core::{Command, DeviceIndex, WorkerError};
use hydra_partition::{DeviceMap, Grid, PartitionReport, Topology};
use smallvec::SmallVec;
use tracing::error;

use crate::model::BodyKinematics;

// ── Window ──────────────────────────────────────────────────────────

/// Which side currently owns the shared fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Window {
    /// Between dispatches. Workers are parked.
    Orchestrator = 0,
    /// Between the two barriers of a dispatch. The orchestrator is parked.
    Workers = 1,
}

// ── Clock ───────────────────────────────────────────────────────────

/// Global run clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clock {
    /// Simulation time.
    pub t: f64,
    /// Current timestep.
    pub dt: f32,
    /// Completed iterations.
    pub iteration: u64,
}

// ── DeviceLayout ────────────────────────────────────────────────────

/// Contiguous index ranges of this node's devices in the host arrays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceLayout {
    /// First index of every local device.
    pub starts: SmallVec<[usize; 8]>,
    /// Particles of every local device.
    pub counts: SmallVec<[usize; 8]>,
    /// Particles of every node.
    pub node_counts: Vec<usize>,
    /// Particles across all nodes.
    pub total: usize,
}

impl DeviceLayout {
    /// All `particles` on a single local device.
    pub fn single(particles: usize) -> Self {
        Self {
            starts: SmallVec::from_slice(&[0]),
            counts: SmallVec::from_slice(&[particles]),
            node_counts: vec![particles],
            total: particles,
        }
    }

    /// The layout produced by the partitioner.
    pub fn from_partition(report: &PartitionReport, topology: &Topology) -> Self {
        let ranges = report.local_ranges(topology);
        Self {
            starts: ranges.iter().map(|r| r.start).collect(),
            counts: ranges.iter().map(|r| r.len()).collect(),
            node_counts: report.node_counts.clone(),
            total: report.node_counts.iter().sum(),
        }
    }

    /// Index range of local device `device`. Empty for unknown devices.
    pub fn device_range(&self, device: DeviceIndex) -> Range<usize> {
        let d = device.as_usize();
        match (self.starts.get(d), self.counts.get(d)) {
            (Some(&start), Some(&count)) => start..start + count,
            _ => 0..0,
        }
    }

    /// Particles on this node.
    pub fn process_count(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Index range of the whole node.
    pub fn node_range(&self) -> Range<usize> {
        let start = self.starts.first().copied().unwrap_or(0);
        start..start + self.process_count()
    }
}

// ── DeviceReport ────────────────────────────────────────────────────

/// Results a worker publishes for the orchestrator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceReport {
    /// Largest stable timestep found by the last force pass.
    pub dt: f32,
    /// Particles owned by the device, excluding halo copies.
    pub internal_particles: usize,
    /// Whether open boundaries created particles in the last step.
    pub particles_created: bool,
    /// Largest neighbour count of the last neighbour-list build.
    pub max_neibs: u32,
    /// Particle interactions of the last neighbour-list build.
    pub interactions: u64,
    /// Partial fluid force on every forces body.
    pub body_forces: Vec<[f32; 3]>,
    /// Partial fluid torque on every forces body.
    pub body_torques: Vec<[f32; 3]>,
    /// Water depth per open boundary.
    pub water_depth: Vec<u32>,
    /// First failure of the device, if any.
    pub error: Option<WorkerError>,
}

// ── SharedState ─────────────────────────────────────────────────────

/// Process-wide state of one node's run.
#[derive(Debug)]
pub struct SharedState {
    topology: Topology,
    grid: Grid,
    device_map: DeviceMap,
    window: AtomicU8,
    command: RwLock<Command>,
    keep_going: AtomicBool,
    quit_request: AtomicBool,
    save_request: AtomicBool,
    clock: RwLock<Clock>,
    layout: RwLock<DeviceLayout>,
    host: RwLock<BufferList>,
    reports: Vec<Mutex<DeviceReport>>,
    gravity: RwLock<[f32; 3]>,
    bodies: RwLock<Vec<BodyKinematics>>,
    water_depth: RwLock<Vec<u32>>,
}

// Compile-time assertion: SharedState crosses into every worker thread.
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<SharedState>();
    }
    let _ = check;
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl SharedState {
    /// Creates the state for a node whose host arrays are already
    /// partitioned according to `layout`.
    pub fn new(
        topology: Topology,
        grid: Grid,
        device_map: DeviceMap,
        host: BufferList,
        layout: DeviceLayout,
        clock: Clock,
    ) -> Self {
        let reports = (0..topology.local_devices())
            .map(|d| {
                Mutex::new(DeviceReport {
                    dt: clock.dt,
                    internal_particles: layout.counts.get(d).copied().unwrap_or(0),
                    ..DeviceReport::default()
                })
            })
            .collect();
        Self {
            topology,
            grid,
            device_map,
            window: AtomicU8::new(Window::Orchestrator as u8),
            command: RwLock::new(Command::idle()),
            keep_going: AtomicBool::new(false),
            quit_request: AtomicBool::new(false),
            save_request: AtomicBool::new(false),
            clock: RwLock::new(clock),
            layout: RwLock::new(layout),
            host: RwLock::new(host),
            reports,
            gravity: RwLock::new([0.0, 0.0, -9.81]),
            bodies: RwLock::new(Vec::new()),
            water_depth: RwLock::new(Vec::new()),
        }
    }

    /// Node and device layout.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Cell grid.
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Cell ownership.
    pub fn device_map(&self) -> &DeviceMap {
        &self.device_map
    }

    /// Local device count.
    pub fn devices(&self) -> usize {
        self.reports.len()
    }

    // ── Windows ─────────────────────────────────────────────────────

    /// Current owner of the shared fields.
    pub fn window(&self) -> Window {
        if self.window.load(Ordering::Acquire) == Window::Workers as u8 {
            Window::Workers
        } else {
            Window::Orchestrator
        }
    }

    pub(crate) fn set_window(&self, window: Window) {
        self.window.store(window as u8, Ordering::Release);
    }

    fn debug_check_orchestrator(&self, what: &str) {
        debug_assert_eq!(
            self.window(),
            Window::Orchestrator,
            "{what} written inside the workers' window"
        );
    }

    // ── Command ─────────────────────────────────────────────────────

    /// The posted command.
    pub fn command(&self) -> Command {
        *read(&self.command)
    }

    /// Posts `command`. Orchestrator window only.
    pub fn post(&self, command: Command) {
        self.debug_check_orchestrator("command");
        *write(&self.command) = command;
    }

    // ── Flags ───────────────────────────────────────────────────────

    /// Whether commands may still be posted.
    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }

    /// Sets the liveness flag.
    pub fn set_keep_going(&self, value: bool) {
        self.keep_going.store(value, Ordering::Release);
    }

    /// Asks the loop to terminate after the current iteration.
    /// Any participant may call this.
    pub fn request_quit(&self) {
        self.quit_request.store(true, Ordering::Release);
    }

    /// Whether termination was requested.
    pub fn quit_requested(&self) -> bool {
        self.quit_request.load(Ordering::Acquire)
    }

    /// Asks for a forced save at the end of the current iteration.
    pub fn request_save(&self) {
        self.save_request.store(true, Ordering::Release);
    }

    /// Whether a save was requested.
    pub fn save_requested(&self) -> bool {
        self.save_request.load(Ordering::Acquire)
    }

    /// Clears and returns the save request.
    pub fn take_save_request(&self) -> bool {
        self.save_request.swap(false, Ordering::AcqRel)
    }

    /// Records the first failure of `device` and clears liveness.
    pub fn record_failure(&self, device: DeviceIndex, err: WorkerError) {
        error!(device = device.0, error = %err, "device worker failed");
        let mut report = self.report(device);
        if report.error.is_none() {
            report.error = Some(err);
        }
        drop(report);
        self.set_keep_going(false);
    }

    /// The failure of the lowest-indexed failed device.
    pub fn first_failure(&self) -> Option<WorkerError> {
        self.reports.iter().find_map(|r| {
            r.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .error
                .clone()
        })
    }

    // ── Clock and layout ────────────────────────────────────────────

    /// The run clock.
    pub fn clock(&self) -> Clock {
        *read(&self.clock)
    }

    /// Replaces the clock. Orchestrator window only.
    pub fn set_clock(&self, clock: Clock) {
        self.debug_check_orchestrator("clock");
        *write(&self.clock) = clock;
    }

    /// Snapshot of the device layout.
    pub fn layout(&self) -> DeviceLayout {
        read(&self.layout).clone()
    }

    /// Index range of local device `device`.
    pub fn device_range(&self, device: DeviceIndex) -> Range<usize> {
        read(&self.layout).device_range(device)
    }

    /// Replaces the device layout. Orchestrator window only.
    pub fn set_layout(&self, layout: DeviceLayout) {
        self.debug_check_orchestrator("layout");
        *write(&self.layout) = layout;
    }

    // ── Host buffers ────────────────────────────────────────────────

    /// Host particle arrays.
    pub fn host(&self) -> RwLockReadGuard<'_, BufferList> {
        read(&self.host)
    }

    /// Mutable host particle arrays. Workers only touch their own
    /// device range.
    pub fn host_mut(&self) -> RwLockWriteGuard<'_, BufferList> {
        write(&self.host)
    }

    // ── Reports ─────────────────────────────────────────────────────

    /// Report of local device `device`.
    ///
    /// # Panics
    ///
    /// If `device` is not a local device.
    pub fn report(&self, device: DeviceIndex) -> MutexGuard<'_, DeviceReport> {
        self.reports[device.as_usize()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies of every device report, in device order.
    pub fn reports(&self) -> Vec<DeviceReport> {
        self.reports
            .iter()
            .map(|r| r.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    // ── Model state ─────────────────────────────────────────────────

    /// Current gravity.
    pub fn gravity(&self) -> [f32; 3] {
        *read(&self.gravity)
    }

    /// Updates gravity. Orchestrator window only.
    pub fn set_gravity(&self, gravity: [f32; 3]) {
        self.debug_check_orchestrator("gravity");
        *write(&self.gravity) = gravity;
    }

    /// Current body kinematics.
    pub fn bodies(&self) -> Vec<BodyKinematics> {
        read(&self.bodies).clone()
    }

    /// Updates body kinematics. Orchestrator window only.
    pub fn set_bodies(&self, bodies: &[BodyKinematics]) {
        self.debug_check_orchestrator("body kinematics");
        let mut slot = write(&self.bodies);
        slot.clear();
        slot.extend_from_slice(bodies);
    }

    /// Reduced water depth per open boundary.
    pub fn water_depth(&self) -> Vec<u32> {
        read(&self.water_depth).clone()
    }

    /// Updates the reduced water depth. Orchestrator window only.
    pub fn set_water_depth(&self, depth: Vec<u32>) {
        self.debug_check_orchestrator("water depth");
        *write(&self.water_depth) = depth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::{CommandKind, GlobalDeviceId, NodeRank};

    fn state(devices: usize) -> SharedState {
        let topology = Topology::single_node(devices).unwrap();
        let grid = Grid::new([0.0; 3], [1.0; 3], [2, 1, 1]).unwrap();
        let map = DeviceMap::uniform(
            &grid,
            GlobalDeviceId::new(NodeRank::COORDINATOR, DeviceIndex(0)),
        );
        let layout = DeviceLayout {
            starts: SmallVec::from_slice(&[0, 4]),
            counts: SmallVec::from_slice(&[4, 6]),
            node_counts: vec![10],
            total: 10,
        };
        SharedState::new(
            topology,
            grid,
            map,
            BufferList::new(10),
            layout,
            Clock {
                t: 0.0,
                dt: 0.5,
                iteration: 0,
            },
        )
    }

    #[test]
    fn layout_ranges() {
        let s = state(2);
        assert_eq!(s.device_range(DeviceIndex(1)), 4..10);
        assert_eq!(s.device_range(DeviceIndex(5)), 0..0);
        assert_eq!(s.layout().node_range(), 0..10);
        assert_eq!(s.report(DeviceIndex(1)).internal_particles, 6);
        assert_eq!(s.report(DeviceIndex(0)).dt, 0.5);
    }

    #[test]
    fn post_and_read_command() {
        let s = state(2);
        assert_eq!(s.command().kind, CommandKind::Idle);
        s.post(Command::new(CommandKind::Euler).with_arg(0.25));
        assert_eq!(s.command().kind, CommandKind::Euler);
        assert_eq!(s.command().arg, 0.25);
    }

    #[test]
    fn save_request_is_consumed_once() {
        let s = state(1);
        assert!(!s.take_save_request());
        s.request_save();
        assert!(s.save_requested());
        assert!(s.take_save_request());
        assert!(!s.save_requested());
    }

    #[test]
    fn first_failure_wins() {
        let s = state(2);
        s.set_keep_going(true);
        let d = DeviceIndex(1);
        s.record_failure(d, WorkerError::execution(d, CommandKind::Sort, "a"));
        s.record_failure(d, WorkerError::execution(d, CommandKind::Euler, "b"));
        assert!(!s.keep_going());
        assert!(matches!(
            s.first_failure(),
            Some(WorkerError::Execution {
                command: CommandKind::Sort,
                ..
            })
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "inside the workers' window")]
    fn posting_inside_workers_window_is_caught() {
        let s = state(1);
        s.set_window(Window::Workers);
        s.post(Command::idle());
    }
}
