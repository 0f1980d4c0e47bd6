//! The simulation loop state machine.
//!
//! ```text
//! Uninitialized ──initialize()──▶ Initialized ──run()──▶ Uploading
//!       ──▶ Running ──▶ Finalizing ──▶ Terminated
//! ```
//!
//! [`initialize`](Simulation::initialize) validates the configuration,
//! hashes and partitions the particles, spawns one worker per device
//! and passes the end-of-init barrier. [`run`](Simulation::run) drives
//! the upload barriers, iterates until the model is done, a cap or a
//! quit request is hit, or a command fails, then shuts the workers
//! down. Every error raised while iterating clears liveness and
//! force-unlocks the synchronizer before the loop unwinds, so
//! surviving workers never deadlock.

use std::sync::Arc;
use std::time::Duration;

use hydra_arena::{BufferList, ParticleKind};
use hydra_core::{
    BufferKey, BufferSet, Command, CommandFlags, CommandKind, DeviceIndex, IntegratorStep,
    WorkerError,
};
use hydra_partition::{partition, DeviceMap, Grid, Topology};
use tracing::{debug, error, info, warn};

use crate::barrier::Synchronizer;
use crate::config::{
    BoundaryModel, HotStartName, SimulationConfig, SphFormulation, ViscosityModel,
};
use crate::dispatch::CommandDispatcher;
use crate::error::{DispatchError, RunError};
use crate::indices::{self, ReconcileOptions};
use crate::metrics::{IppsCounter, PeakSpeed};
use crate::model::{BodyKinematics, Model};
use crate::reduction::{ReduceOp, Reduction};
use crate::rollcall::{RollCall, RollCallReport};
use crate::shared::{Clock, DeviceLayout, SharedState};
use crate::worker::{DeviceWorker, WorkerExit, WorkerHandle};
use crate::writer::{DueSinks, OutputSink, SinkSet, WriteRequest};

// ── RunState ────────────────────────────────────────────────────────

/// Lifecycle of a [`Simulation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Constructed. No thread exists yet.
    Uninitialized,
    /// Partitioned, workers spawned and the init barrier passed.
    Initialized,
    /// Devices are copying their partitions.
    Uploading,
    /// Iterating.
    Running,
    /// Shutting the workers down.
    Finalizing,
    /// All workers joined.
    Terminated,
}

// ── DomainSetup ─────────────────────────────────────────────────────

/// Initial particles and decomposition inputs.
#[derive(Clone, Debug)]
pub struct DomainSetup {
    /// Cell grid.
    pub grid: Grid,
    /// Host arrays of every particle of the run, with at least the
    /// `Pos`, `Vel`, `Info` and `Hash` columns registered.
    pub particles: BufferList,
    /// Cell ownership. Multi-device runs derive one by slicing the
    /// longest grid axis when `None`.
    pub device_map: Option<DeviceMap>,
}

// ── RunSummary ──────────────────────────────────────────────────────

/// Final diagnostics of a completed run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Completed iterations.
    pub iterations: u64,
    /// Final simulation time.
    pub t: f64,
    /// Final timestep.
    pub dt: f32,
    /// Particles across all nodes at the end.
    pub particles: usize,
    /// Wall-clock time spent iterating.
    pub elapsed: Duration,
    /// Node throughput over the whole run.
    pub mipps: f64,
    /// Highest particle speed seen in any write.
    pub peak_speed: PeakSpeed,
    /// Whether the run ended on a quit request.
    pub quit_requested: bool,
    /// Commands posted to the workers, including `Quit`.
    pub commands: u64,
    /// Neighbour-list rebuilds performed.
    pub neighbour_rebuilds: u64,
    /// Roll-call anomalies reported.
    pub roll_call_anomalies: usize,
}

// ── Internals ───────────────────────────────────────────────────────

struct Runtime {
    shared: Arc<SharedState>,
    dispatcher: CommandDispatcher,
    workers: Vec<WorkerHandle>,
}

#[derive(Default)]
struct Counters {
    total: IppsCounter,
    interval: IppsCounter,
    cluster: IppsCounter,
}

#[derive(Clone, Debug, Default)]
struct BodyForces {
    forces: Vec<[f32; 3]>,
    torques: Vec<[f32; 3]>,
}

const NONE: CommandFlags = CommandFlags::NONE;

fn key(k: BufferKey) -> BufferSet {
    BufferSet::single(k)
}

// ── Simulation ──────────────────────────────────────────────────────

/// One node's view of a simulation run.
pub struct Simulation<M: Model> {
    config: SimulationConfig,
    model: M,
    reduction: Box<dyn Reduction>,
    sinks: SinkSet,
    setup: Option<DomainSetup>,
    topology: Option<Topology>,
    state: RunState,
    runtime: Option<Runtime>,
    roll_call: RollCall,
    roll_call_anomalies: usize,
    counters: Counters,
    peak_speed: PeakSpeed,
    particles_created: bool,
    created_iterations: u64,
    neighbour_rebuilds: u64,
    last_max_neibs: u32,
    max_neibs_seen: u32,
    interactions: u64,
    applied: BodyForces,
}

impl<M: Model> std::fmt::Debug for Simulation<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("state", &self.state)
            .field("devices", &self.config.devices)
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

impl<M: Model> Simulation<M> {
    /// Creates an uninitialized simulation.
    pub fn new(
        config: SimulationConfig,
        model: M,
        setup: DomainSetup,
        reduction: Box<dyn Reduction>,
    ) -> Self {
        Self {
            config,
            model,
            reduction,
            sinks: SinkSet::default(),
            setup: Some(setup),
            topology: None,
            state: RunState::Uninitialized,
            runtime: None,
            roll_call: RollCall::new(),
            roll_call_anomalies: 0,
            counters: Counters::default(),
            peak_speed: PeakSpeed::default(),
            particles_created: false,
            created_iterations: 0,
            neighbour_rebuilds: 0,
            last_max_neibs: 0,
            max_neibs_seen: 0,
            interactions: 0,
            applied: BodyForces::default(),
        }
    }

    /// Registers an output sink.
    pub fn add_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sinks.push(sink);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Shared state, once initialized.
    pub fn shared(&self) -> Option<&Arc<SharedState>> {
        self.runtime.as_ref().map(|rt| &rt.shared)
    }

    /// Highest particle speed seen so far.
    pub fn peak_speed(&self) -> PeakSpeed {
        self.peak_speed
    }

    /// Iterations in which open boundaries created particles.
    pub fn created_iterations(&self) -> u64 {
        self.created_iterations
    }

    /// Largest neighbour count reported by any build.
    pub fn max_neibs(&self) -> u32 {
        self.max_neibs_seen
    }

    /// Interactions accumulated over every neighbour-list build.
    pub fn interactions(&self) -> u64 {
        self.interactions
    }

    /// Fluid forces and torques applied to the forces bodies in the
    /// last integration stage.
    pub fn applied_body_forces(&self) -> (&[[f32; 3]], &[[f32; 3]]) {
        (&self.applied.forces, &self.applied.torques)
    }

    // ── Small helpers ───────────────────────────────────────────────

    fn expect_state(&self, expected: RunState) -> Result<(), RunError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RunError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn transition(&mut self, next: RunState) {
        info!(from = ?self.state, to = ?next, "simulation state");
        self.state = next;
    }

    fn runtime(&self) -> Result<&Runtime, RunError> {
        self.runtime.as_ref().ok_or(RunError::InvalidState {
            expected: RunState::Running,
            actual: self.state,
        })
    }

    fn shared_arc(&self) -> Result<Arc<SharedState>, RunError> {
        Ok(Arc::clone(&self.runtime()?.shared))
    }

    fn dispatch(&mut self, command: Command) -> Result<(), RunError> {
        let state = self.state;
        let rt = self.runtime.as_mut().ok_or(RunError::InvalidState {
            expected: RunState::Running,
            actual: state,
        })?;
        rt.dispatcher.dispatch(command)?;
        Ok(())
    }

    fn issue(
        &mut self,
        kind: CommandKind,
        buffers: impl Into<BufferSet>,
        flags: CommandFlags,
    ) -> Result<(), RunError> {
        self.dispatch(Command::new(kind).on(buffers).with_flags(flags))
    }

    fn multi_device(&self) -> bool {
        self.topology.as_ref().is_some_and(|t| t.total_devices() > 1)
    }

    fn multi_node(&self) -> bool {
        self.topology.as_ref().is_some_and(Topology::is_multi_node)
    }

    fn semi_analytical(&self) -> bool {
        self.config.semi_analytical()
    }

    fn failure_or(&self, fallback: RunError) -> RunError {
        self.runtime
            .as_ref()
            .and_then(|rt| rt.shared.first_failure())
            .map_or(fallback, RunError::Worker)
    }

    // ── Initialization ──────────────────────────────────────────────

    /// Partitions the particles, spawns `workers` and waits for every
    /// device to initialize.
    ///
    /// `workers` must hold one worker per local device.
    pub fn initialize(&mut self, workers: Vec<Box<dyn DeviceWorker>>) -> Result<(), RunError> {
        self.expect_state(RunState::Uninitialized)?;
        let Some(DomainSetup {
            grid,
            mut particles,
            device_map,
        }) = self.setup.take()
        else {
            return Err(RunError::InvalidState {
                expected: RunState::Uninitialized,
                actual: self.state,
            });
        };

        self.config.validate(particles.len())?;
        let topology = self.config.topology()?;
        if workers.len() != topology.local_devices() {
            return Err(RunError::WorkerCount {
                expected: topology.local_devices(),
                actual: workers.len(),
            });
        }
        self.model.initialize()?;

        let mut clock = Clock {
            t: 0.0,
            dt: self.config.dt,
            iteration: 0,
        };
        if let Some(resume) = &self.config.resume {
            let name = HotStartName::parse(&resume.file)?;
            info!(
                file = %resume.file.display(),
                ranks = name.ranks,
                t = resume.t,
                iteration = resume.iteration,
                "resuming from hot start"
            );
            clock = Clock {
                t: resume.t,
                dt: resume.dt,
                iteration: resume.iteration,
            };
        }

        grid.hash_particles(&mut particles)?;
        let (device_map, layout) = if topology.total_devices() > 1 {
            let map = match device_map {
                Some(map) => map,
                None => self.prepare_device_map(&grid, &particles, &topology)?,
            };
            map.validate(&topology)?;
            let report = partition(&mut particles, &map, &topology)?;
            (map, DeviceLayout::from_partition(&report, &topology))
        } else {
            let map = device_map.unwrap_or_else(|| {
                DeviceMap::uniform(&grid, topology.global_id(DeviceIndex(0)))
            });
            (map, DeviceLayout::single(particles.len()))
        };
        for d in 0..topology.local_devices() {
            let range = layout.device_range(DeviceIndex(d as u8));
            info!(
                device = d,
                start = range.start,
                particles = range.len(),
                "device partition"
            );
        }
        info!(
            rank = topology.rank().0,
            particles = layout.process_count(),
            total = layout.total,
            "node partition"
        );

        let bodies = self.model.bodies();
        let shared = Arc::new(SharedState::new(
            topology.clone(),
            grid,
            device_map,
            particles,
            layout,
            clock,
        ));
        shared.set_bodies(&vec![BodyKinematics::default(); bodies.bodies]);
        self.applied = BodyForces {
            forces: vec![[0.0; 3]; bodies.forces_bodies],
            torques: vec![[0.0; 3]; bodies.forces_bodies],
        };
        self.topology = Some(topology);

        let sync = Arc::new(Synchronizer::new(self.config.devices + 1));
        shared.set_keep_going(true);
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            match WorkerHandle::spawn(worker, Arc::clone(&shared), Arc::clone(&sync)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.set_keep_going(false);
                    sync.force_unlock();
                    handles.into_iter().for_each(|h| {
                        h.join();
                    });
                    self.transition(RunState::Terminated);
                    return Err(e);
                }
            }
        }
        self.runtime = Some(Runtime {
            shared: Arc::clone(&shared),
            dispatcher: CommandDispatcher::new(Arc::clone(&shared), Arc::clone(&sync)),
            workers: handles,
        });

        // End of initialization.
        if !sync.barrier().is_released() || !shared.keep_going() {
            let err = self.failure_or(RunError::InitializationFailed);
            error!(error = %err, "device initialization failed");
            self.abort_workers();
            self.transition(RunState::Terminated);
            return Err(err);
        }
        self.transition(RunState::Initialized);
        Ok(())
    }

    // Slice the longest axis so every device receives a similar load.
    // Lennard-Jones boundaries are cheap, so only fluid counts there.
    fn prepare_device_map(
        &self,
        grid: &Grid,
        particles: &BufferList,
        topology: &Topology,
    ) -> Result<DeviceMap, RunError> {
        let axis = grid.longest_axis();
        let fluid_only = self.config.boundary == BoundaryModel::LennardJones;
        let histogram = grid.slice_histogram(particles, axis, |info| {
            !fluid_only || info.kind == ParticleKind::Fluid
        })?;
        debug!(axis, "deriving device map from slice histogram");
        Ok(DeviceMap::split_along(grid, axis, &histogram, topology)?)
    }

    fn abort_workers(&mut self) {
        if let Some(rt) = self.runtime.as_mut() {
            rt.shared.set_keep_going(false);
            rt.dispatcher.force_unlock();
            for handle in rt.workers.drain(..) {
                handle.join();
            }
        }
    }

    // ── Run ─────────────────────────────────────────────────────────

    /// Runs the simulation to completion and shuts the workers down.
    ///
    /// Returns the first error that aborted the loop, after every
    /// worker has been joined.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        self.expect_state(RunState::Initialized)?;
        let outcome = self.drive();
        let failure = match outcome {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "simulation aborted");
                if let Some(rt) = self.runtime.as_ref() {
                    rt.shared.set_keep_going(false);
                    rt.dispatcher.force_unlock();
                }
                Some(match e {
                    RunError::Dispatch(DispatchError::Aborted { .. }) => self.failure_or(e),
                    e => e,
                })
            }
        };
        let failure = self.shutdown(failure);
        let summary = self.summarize();
        match failure {
            Some(e) => Err(e),
            None => summary,
        }
    }

    fn drive(&mut self) -> Result<(), RunError> {
        self.do_write(CommandFlags::INITIALIZATION_STEP, self.base_buffers(), self.sinks.all())?;

        self.transition(RunState::Uploading);
        let shared = self.shared_arc()?;
        let uploaded = self.runtime()?.dispatcher.rendezvous();
        if !uploaded.is_released() || !shared.keep_going() {
            return Err(self.failure_or(RunError::InitializationFailed));
        }

        self.transition(RunState::Running);
        if self.semi_analytical() {
            self.build_neib_list()?;
            self.sa_boundary_conditions(CommandFlags::INITIALIZATION_STEP)?;
        }

        self.counters.total.start();
        self.counters.interval.start();
        self.counters.cluster.start();
        self.print_status();

        while shared.keep_going() {
            self.iterate()?;
        }
        Ok(())
    }

    fn summarize(&self) -> Result<RunSummary, RunError> {
        let shared = self.shared_arc()?;
        let clock = shared.clock();
        let elapsed = self.counters.total.elapsed();
        let mipps = self.counters.total.mipps();
        info!(
            iterations = clock.iteration,
            t = clock.t,
            elapsed_secs = elapsed.as_secs_f64(),
            mipps,
            "simulation finished"
        );
        if self.multi_node() {
            info!(mipps = self.counters.cluster.mipps(), "cluster throughput");
        }
        info!(
            peak_speed = self.peak_speed.speed,
            at = self.peak_speed.t,
            suggested_sound_speed = self.peak_speed.suggested_sound_speed(),
            "peak particle speed"
        );
        Ok(RunSummary {
            iterations: clock.iteration,
            t: clock.t,
            dt: clock.dt,
            particles: shared.layout().total,
            elapsed,
            mipps,
            peak_speed: self.peak_speed,
            quit_requested: shared.quit_requested(),
            commands: self.runtime()?.dispatcher.issued(),
            neighbour_rebuilds: self.neighbour_rebuilds,
            roll_call_anomalies: self.roll_call_anomalies,
        })
    }

    fn shutdown(&mut self, mut failure: Option<RunError>) -> Option<RunError> {
        self.transition(RunState::Finalizing);
        if let Some(rt) = self.runtime.as_mut() {
            rt.shared.set_keep_going(false);
            rt.dispatcher.post_quit();
            // End of finalization.
            rt.dispatcher.barrier();
            for handle in rt.workers.drain(..) {
                let device = handle.device();
                let exit = handle.join();
                debug!(device = device.0, ?exit, "device worker joined");
                if exit == WorkerExit::Panicked && failure.is_none() {
                    failure = Some(RunError::Worker(WorkerError::Lifecycle {
                        device,
                        reason: "worker panicked".into(),
                    }));
                }
            }
            if failure.is_none() {
                failure = rt.shared.first_failure().map(RunError::Worker);
            }
        }
        self.transition(RunState::Terminated);
        failure
    }

    fn print_status(&self) {
        let Ok(rt) = self.runtime() else {
            return;
        };
        let clock = rt.shared.clock();
        info!(
            t = clock.t,
            iteration = clock.iteration,
            dt = clock.dt,
            particles = rt.shared.layout().total,
            mipps_interval = self.counters.interval.mipps(),
            mipps = self.counters.total.mipps(),
            max_neibs = self.last_max_neibs,
            "status"
        );
    }

    // ── Iteration ───────────────────────────────────────────────────

    fn iterate(&mut self) -> Result<(), RunError> {
        let shared = self.shared_arc()?;
        let iteration = shared.clock().iteration;

        if iteration % self.config.buildneibs_freq == 0 || self.particles_created {
            self.build_neib_list()?;
        }

        if iteration > 0 {
            for i in 0..self.config.filters.len() {
                let filter = self.config.filters[i];
                if iteration % filter.frequency != 0 {
                    continue;
                }
                self.dispatch(
                    Command::new(CommandKind::Filter)
                        .with_flags(CommandFlags::ONLY_INTERNAL)
                        .with_arg(filter.kind as f32),
                )?;
                if self.multi_device() {
                    self.issue(CommandKind::UpdateExternal, key(BufferKey::Vel).write(), NONE)?;
                }
                self.issue(CommandKind::SwapBuffers, BufferKey::Vel, NONE)?;
            }
        }

        if self.model.has_gravity_callback() {
            self.update_gravity(&shared)?;
        }

        self.integration_stage(IntegratorStep::Predictor)?;
        self.integration_stage(IntegratorStep::Corrector)?;
        self.advance_clock(&shared)
    }

    fn update_gravity(&mut self, shared: &SharedState) -> Result<(), RunError> {
        let gravity = self.model.gravity(shared.clock().t);
        shared.set_gravity(gravity);
        self.issue(CommandKind::UploadGravity, BufferSet::empty(), NONE)
    }

    fn integration_stage(&mut self, step: IntegratorStep) -> Result<(), RunError> {
        let shared = self.shared_arc()?;
        let flag = step.flag();
        let internal = flag | CommandFlags::ONLY_INTERNAL;
        let md = self.multi_device();
        let empty = BufferSet::empty();

        if self.config.formulation == SphFormulation::Grenier {
            self.issue(CommandKind::SwapBuffers, BufferKey::Vel, NONE)?;
            self.issue(CommandKind::ComputeDensity, empty, internal)?;
            if md {
                self.issue(
                    CommandKind::UpdateExternal,
                    (BufferKey::Sigma | BufferKey::Vel).write(),
                    NONE,
                )?;
            }
            self.issue(CommandKind::SwapBuffers, BufferKey::Vel, NONE)?;
        }

        if self.config.viscosity == ViscosityModel::Sps {
            self.issue(CommandKind::Sps, empty, internal)?;
            if md {
                self.issue(CommandKind::UpdateExternal, BufferKey::Tau, NONE)?;
            }
        }

        if self.config.inspect_preforce {
            let all = self.sinks.all();
            self.save_particles(false, flag, all)?;
        }

        let striping = self.config.striping && md;
        let forces = if striping {
            CommandKind::ForcesEnqueue
        } else {
            CommandKind::ForcesSync
        };
        self.issue(forces, empty, internal)?;
        if md {
            self.issue(
                CommandKind::UpdateExternal,
                BufferSet::POST_FORCES_UPDATE.write(),
                NONE,
            )?;
        }
        if striping {
            self.issue(CommandKind::ForcesComplete, empty, internal)?;
        }

        let swap = match step {
            IntegratorStep::Predictor => key(BufferKey::BoundElements),
            IntegratorStep::Corrector => BufferKey::Pos
                | BufferKey::Vel
                | BufferKey::InternalEnergy
                | BufferKey::Volume
                | BufferKey::Tke
                | BufferKey::Epsilon
                | BufferKey::BoundElements,
        };
        self.issue(CommandKind::SwapBuffers, swap, NONE)?;

        self.move_bodies(step)?;

        let density_sum = self.config.flags.density_sum;
        let euler_flags = if density_sum { internal } else { flag };
        self.dispatch(
            Command::new(CommandKind::Euler)
                .with_flags(euler_flags)
                .with_arg(shared.clock().dt),
        )?;
        if density_sum && md {
            self.issue(
                CommandKind::UpdateExternal,
                (BufferKey::Pos
                    | BufferKey::Vel
                    | BufferKey::EulerVel
                    | BufferKey::Tke
                    | BufferKey::Epsilon
                    | BufferKey::BoundElements
                    | BufferKey::GradGamma)
                    .write(),
                NONE,
            )?;
            if step == IntegratorStep::Predictor {
                self.issue(
                    CommandKind::UpdateExternal,
                    (BufferKey::Vel | BufferKey::GradGamma).read(),
                    NONE,
                )?;
            }
        }

        if step == IntegratorStep::Corrector && self.model.bodies().bodies > 0 {
            self.issue(CommandKind::EulerUploadObjectsCg, empty, NONE)?;
        }
        self.issue(CommandKind::SwapBuffers, BufferKey::BoundElements, NONE)?;

        if step == IntegratorStep::Predictor && self.model.has_gravity_callback() {
            self.update_gravity(&shared)?;
        }

        if self.semi_analytical() {
            self.sa_boundary_conditions(flag)?;
        }

        if step == IntegratorStep::Corrector && self.config.flags.inlet_outlet {
            self.issue(CommandKind::DownloadNewNumParts, empty, NONE)?;
            let local = shared.reports().iter().any(|r| r.particles_created);
            self.particles_created = if self.multi_node() {
                self.reduction.all_reduce_bool(local)?
            } else {
                local
            };
            if self.particles_created {
                self.created_iterations += 1;
            }
        }

        self.issue(CommandKind::SwapBuffers, BufferSet::POST_COMPUTE_SWAP, NONE)
    }

    fn advance_clock(&mut self, shared: &SharedState) -> Result<(), RunError> {
        let mut clock = shared.clock();
        clock.iteration += 1;
        let layout = shared.layout();
        self.counters.total.record(layout.process_count());
        self.counters.interval.record(layout.process_count());
        self.counters.cluster.record(layout.total);

        let previous_t = clock.t;
        clock.t += f64::from(clock.dt);
        if self.config.flags.adaptive_dt {
            let mut dt = [shared
                .reports()
                .iter()
                .map(|r| r.dt)
                .fold(f32::INFINITY, f32::min)];
            if self.multi_node() {
                self.reduction.all_reduce_f32(&mut dt, ReduceOp::Min)?;
            }
            clock.dt = dt[0];
        }
        shared.set_clock(clock);

        if clock.t == 0.0 {
            return Err(RunError::DtZero {
                iteration: clock.iteration,
            });
        }
        if !(clock.dt.is_finite() && clock.dt >= f32::EPSILON) {
            error!(
                iteration = clock.iteration,
                t = clock.t,
                dt = clock.dt,
                "timestep is not distinguishable from zero, requesting quit"
            );
            shared.request_quit();
        }
        if clock.t == previous_t {
            error!(
                iteration = clock.iteration,
                t = clock.t,
                dt = clock.dt,
                "simulation time does not advance, requesting quit"
            );
            shared.request_quit();
        }

        let max_iterations = self.config.max_iterations;
        let we_are_done = self.model.finished(clock.t)
            || (max_iterations > 0 && clock.iteration >= max_iterations)
            || shared.quit_requested();

        let due = self.sinks.due(clock.t);
        let save_requested = shared.take_save_request();
        let force_write = self.model.need_write(clock.t) || we_are_done || save_requested;

        if !due.is_empty() || force_write {
            if self.config.nosave && !force_write {
                self.sinks.fake_mark_written(&due, clock.t);
            } else {
                let max_frequency = self.sinks.max_frequency(&due);
                let (flags, targets) = if force_write {
                    (CommandFlags::ALL_INTEGRATION_STEPS, self.sinks.all())
                } else {
                    (NONE, due)
                };
                self.save_particles(true, flags, targets)?;
                if force_write || max_frequency > 0.0 {
                    self.print_status();
                    self.counters.interval.restart();
                }
            }
        }

        if we_are_done {
            shared.set_keep_going(false);
        }
        Ok(())
    }

    // ── Neighbour lists and indices ─────────────────────────────────

    fn build_neib_list(&mut self) -> Result<(), RunError> {
        let shared = self.shared_arc()?;
        let md = self.multi_device();
        let empty = BufferSet::empty();
        self.neighbour_rebuilds += 1;

        self.issue(CommandKind::SwapBuffers, BufferKey::Pos, NONE)?;
        self.issue(CommandKind::CalcHash, empty, NONE)?;
        self.issue(CommandKind::SwapBuffers, BufferKey::Pos | BufferKey::Info, NONE)?;
        self.issue(CommandKind::Sort, empty, NONE)?;
        self.issue(CommandKind::Reorder, empty, NONE)?;
        self.issue(CommandKind::DownloadNewNumParts, empty, NONE)?;
        self.issue(CommandKind::SwapBuffers, BufferSet::all(), NONE)?;

        if md {
            self.issue(CommandKind::DumpCells, empty, NONE)?;
            self.issue(CommandKind::UpdateSegments, empty, NONE)?;
            self.update_array_indices()?;
            self.issue(CommandKind::Crop, empty, NONE)?;
            self.issue(CommandKind::AppendExternal, BufferSet::IMPORT_BUFFERS, NONE)?;
            if self.config.flags.inlet_outlet {
                self.issue(CommandKind::UploadNewNumParts, empty, NONE)?;
            }
        } else {
            self.update_array_indices()?;
        }

        self.issue(CommandKind::BuildNeibs, empty, CommandFlags::ONLY_INTERNAL)?;
        if md && self.semi_analytical() {
            self.issue(CommandKind::UpdateExternal, BufferKey::VertPos, NONE)?;
        }

        let reports = shared.reports();
        let peak = reports.iter().map(|r| r.max_neibs).max().unwrap_or(0);
        if peak > self.config.max_neibs {
            warn!(
                iteration = shared.clock().iteration,
                neighbours = peak,
                max = self.config.max_neibs,
                "neighbour count exceeds the configured maximum"
            );
        }
        self.last_max_neibs = peak;
        self.max_neibs_seen = self.max_neibs_seen.max(peak);
        self.interactions += reports.iter().map(|r| r.interactions).sum::<u64>();
        self.particles_created = false;
        Ok(())
    }

    fn update_array_indices(&mut self) -> Result<(), RunError> {
        let shared = self.shared_arc()?;
        let options = ReconcileOptions {
            inlet_outlet: self.config.flags.inlet_outlet,
            no_leak_warning: self.config.no_leak_warning,
            capacity: self.config.capacity,
        };
        let iteration = shared.clock().iteration;
        let outcome =
            indices::update_array_indices(&shared, self.reduction.as_ref(), options, iteration)?;

        if outcome.unexplained && !self.multi_node() {
            self.issue(CommandKind::Dump, key(BufferKey::Info).read(), NONE)?;
            let report = self.roll_call(&shared, outcome.previous_total)?;
            self.roll_call_anomalies += report.new_anomalies;
        }
        if outcome.capacity_exceeded {
            return Err(RunError::CapacityExceeded {
                particles: outcome.process_count,
                capacity: self.config.capacity,
            });
        }
        Ok(())
    }

    fn roll_call(
        &mut self,
        shared: &SharedState,
        expected: usize,
    ) -> Result<RollCallReport, RunError> {
        let host = shared.host();
        let info = host.info()?;
        Ok(self.roll_call.check(info, &shared.layout(), expected))
    }

    // ── Moving bodies ───────────────────────────────────────────────

    fn move_bodies(&mut self, step: IntegratorStep) -> Result<(), RunError> {
        let counts = self.model.bodies();
        if counts.bodies == 0 {
            return Ok(());
        }
        let shared = self.shared_arc()?;
        let clock = shared.clock();
        let dt = f64::from(clock.dt);
        let empty = BufferSet::empty();

        if counts.forces_bodies > 0 {
            self.issue(CommandKind::ReduceBodiesForces, empty, NONE)?;
            let n = counts.forces_bodies;
            let mut totals = vec![0.0f32; 6 * n];
            for report in shared.reports() {
                for (b, f) in report.body_forces.iter().take(n).enumerate() {
                    for k in 0..3 {
                        totals[6 * b + k] += f[k];
                    }
                }
                for (b, t) in report.body_torques.iter().take(n).enumerate() {
                    for k in 0..3 {
                        totals[6 * b + 3 + k] += t[k];
                    }
                }
            }
            if self.multi_node() {
                self.reduction.all_reduce_f32(&mut totals, ReduceOp::Sum)?;
            }
            self.applied.forces = totals
                .chunks_exact(6)
                .map(|c| [c[0], c[1], c[2]])
                .collect();
            self.applied.torques = totals
                .chunks_exact(6)
                .map(|c| [c[3], c[4], c[5]])
                .collect();
            let t1 = match step {
                IntegratorStep::Predictor => clock.t + dt / 2.0,
                IntegratorStep::Corrector => clock.t + dt,
            };
            self.model.bodies_forces(
                clock.t,
                t1,
                step,
                &mut self.applied.forces,
                &mut self.applied.torques,
            )?;
        }

        let mut kinematics = shared.bodies();
        kinematics.resize(counts.bodies, BodyKinematics::default());
        self.model.bodies_timestep(
            &self.applied.forces,
            &self.applied.torques,
            step,
            dt,
            clock.t,
            &mut kinematics,
        )?;
        if step == IntegratorStep::Corrector {
            self.model.post_timestep(clock.t);
        }
        shared.set_bodies(&kinematics);

        self.issue(CommandKind::UploadObjectsMatrices, empty, NONE)?;
        self.issue(CommandKind::UploadObjectsVelocities, empty, NONE)?;
        if counts.forces_bodies > 0 {
            self.issue(CommandKind::ForcesUploadObjectsCg, empty, NONE)?;
        }
        Ok(())
    }

    // ── Semi-analytical boundaries ──────────────────────────────────

    fn sa_boundary_conditions(&mut self, flags: CommandFlags) -> Result<(), RunError> {
        if !self.config.boundary_engine {
            return Err(RunError::MissingBoundaryEngine);
        }
        let shared = self.shared_arc()?;
        let init = flags.contains(CommandFlags::INITIALIZATION_STEP);
        let md = self.multi_device();
        let io = self.config.flags.inlet_outlet;
        let empty = BufferSet::empty();
        let internal = flags | CommandFlags::ONLY_INTERNAL;
        let init_swap = BufferKey::Vel
            | BufferKey::Tke
            | BufferKey::Epsilon
            | BufferKey::Pos
            | BufferKey::EulerVel
            | BufferKey::GradGamma
            | BufferKey::Vertices;

        if init {
            self.issue(CommandKind::SwapBuffers, BufferKey::Info, NONE)?;
            self.issue(CommandKind::IdentifyCornerVertices, empty, flags)?;
            if md {
                self.issue(CommandKind::UpdateExternal, key(BufferKey::Info).write(), NONE)?;
            }
            self.issue(CommandKind::SwapBuffers, BufferKey::Info, NONE)?;
            if io {
                self.issue(CommandKind::InitIoMassVertexCount, empty, flags)?;
                if md {
                    self.issue(CommandKind::UpdateExternal, BufferKey::Forces, NONE)?;
                }
                self.issue(CommandKind::InitIoMass, empty, flags)?;
                if md {
                    self.issue(CommandKind::UpdateExternal, key(BufferKey::Pos).write(), NONE)?;
                }
                self.issue(CommandKind::SwapBuffers, BufferKey::Pos, NONE)?;
            }
            self.issue(CommandKind::SwapBuffers, init_swap, NONE)?;
        }

        if io {
            if md && self.config.flags.water_depth {
                self.issue(CommandKind::DownloadIoWaterDepth, empty, NONE)?;
                let reports = shared.reports();
                let boundaries = reports.iter().map(|r| r.water_depth.len()).max().unwrap_or(0);
                let mut depth = vec![0u32; boundaries];
                for report in &reports {
                    for (d, &w) in depth.iter_mut().zip(&report.water_depth) {
                        *d = (*d).max(w);
                    }
                }
                if self.multi_node() {
                    self.reduction.all_reduce_u32(&mut depth, ReduceOp::Max)?;
                }
                shared.set_water_depth(depth);
                self.issue(CommandKind::UploadIoWaterDepth, empty, NONE)?;
            }
            self.issue(CommandKind::SwapBuffers, BufferKey::Pos, NONE)?;
            self.issue(CommandKind::ImposeOpenBoundaryCondition, empty, flags)?;
            self.issue(CommandKind::SwapBuffers, BufferKey::Pos, NONE)?;
        }

        if !init {
            self.issue(CommandKind::SwapBuffers, BufferKey::Vertices, NONE)?;
        }

        self.issue(CommandKind::SaCalcSegmentBoundaryConditions, empty, internal)?;
        if md {
            self.issue(
                CommandKind::UpdateExternal,
                BufferSet::POST_SA_SEGMENT_UPDATE.write(),
                NONE,
            )?;
        }
        self.issue(CommandKind::SaCalcVertexBoundaryConditions, empty, internal)?;
        if md {
            self.issue(
                CommandKind::UpdateExternal,
                BufferSet::POST_SA_VERTEX_UPDATE.write(),
                NONE,
            )?;
        }

        if io && flags.contains(CommandFlags::INTEGRATOR_STEP_2) {
            self.issue(CommandKind::DisableOutgoingParts, empty, NONE)?;
            if md {
                self.issue(
                    CommandKind::UpdateExternal,
                    (BufferKey::Pos | BufferKey::Vertices).write(),
                    NONE,
                )?;
            }
        }

        if init {
            self.issue(CommandKind::SwapBuffers, init_swap, NONE)?;
            if self.config.resume.is_none() {
                self.issue(CommandKind::SwapBuffers, BufferKey::BoundElements, NONE)?;
                self.issue(CommandKind::InitGamma, empty, flags)?;
                if md {
                    self.issue(
                        CommandKind::UpdateExternal,
                        (BufferKey::GradGamma | BufferKey::BoundElements).write(),
                        NONE,
                    )?;
                }
                self.issue(
                    CommandKind::SwapBuffers,
                    BufferKey::GradGamma | BufferKey::BoundElements,
                    NONE,
                )?;
            }
        }
        Ok(())
    }

    // ── Saving ──────────────────────────────────────────────────────

    fn base_buffers(&self) -> BufferSet {
        let mut which = BufferKey::Pos | BufferKey::Vel | BufferKey::Info | BufferKey::Hash;
        if self.config.debug_neibs {
            which |= BufferKey::NeibsList;
        }
        if self.config.debug_forces {
            which |= BufferKey::Forces;
        }
        if self.config.flags.internal_energy {
            which |= BufferKey::InternalEnergy;
        }
        if self.semi_analytical() {
            which |= BufferKey::GradGamma | BufferKey::Vertices | BufferKey::BoundElements;
        }
        if self.config.formulation == SphFormulation::Grenier {
            which |= BufferKey::Volume | BufferKey::Sigma;
        }
        if self.config.viscosity == ViscosityModel::KEpsilon {
            which |= BufferKey::Tke | BufferKey::Epsilon | BufferKey::TurbVisc;
        }
        if self.config.viscosity == ViscosityModel::Sps {
            which |= BufferKey::SpsTurbVisc;
        }
        if self.config.flags.inlet_outlet || self.config.viscosity == ViscosityModel::KEpsilon {
            which |= BufferKey::EulerVel;
        }
        which
    }

    fn save_particles(
        &mut self,
        post_process: bool,
        flags: CommandFlags,
        targets: DueSinks,
    ) -> Result<(), RunError> {
        let mut which = self.base_buffers();
        if post_process {
            for i in 0..self.config.post_processes.len() {
                let pass = self.config.post_processes[i];
                self.dispatch(
                    Command::new(CommandKind::PostProcess)
                        .with_flags(flags | CommandFlags::ONLY_INTERNAL)
                        .with_arg(pass.kind as f32),
                )?;
                self.issue(CommandKind::SwapBuffers, pass.written, NONE)?;
                which |= pass.updated | pass.written;
            }
        }
        self.dispatch(Command::new(CommandKind::Dump).on(which.read()).with_flags(flags))?;
        self.do_write(flags, which, targets)
    }

    fn do_write(
        &mut self,
        flags: CommandFlags,
        buffers: BufferSet,
        targets: DueSinks,
    ) -> Result<(), RunError> {
        let shared = self.shared_arc()?;
        let clock = shared.clock();
        let range = shared.layout().node_range();
        let host = shared.host();

        let local_peak = host
            .vel()
            .ok()
            .and_then(|vel| vel.get(range.clone()))
            .map_or(0.0, PeakSpeed::max_speed);
        let non_finite = host
            .pos()
            .ok()
            .and_then(|pos| pos.get(range.clone()))
            .is_some_and(|pos| pos.iter().any(|p| p.iter().any(|c| !c.is_finite())));
        if non_finite {
            warn!(iteration = clock.iteration, t = clock.t, "non-finite particle positions");
        }
        let mut peak = [local_peak];
        if self.multi_node() {
            self.reduction.all_reduce_f64(&mut peak, ReduceOp::Max)?;
        }
        self.peak_speed.observe(peak[0], clock.t);

        let request = WriteRequest {
            t: clock.t,
            iteration: clock.iteration,
            flags,
            buffers,
            particles: &host,
            range,
        };
        self.sinks.write(&targets, &request)?;
        drop(host);
        self.sinks.mark_written(&targets, clock.t);
        Ok(())
    }
}

impl<M: Model> Drop for Simulation<M> {
    fn drop(&mut self) {
        let Some(rt) = self.runtime.as_mut() else {
            return;
        };
        if rt.workers.is_empty() {
            return;
        }
        rt.shared.set_keep_going(false);
        rt.dispatcher.force_unlock();
        for handle in rt.workers.drain(..) {
            handle.join();
        }
    }
}
