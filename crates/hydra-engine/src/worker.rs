//! Device worker harness.
//!
//! Each [`DeviceWorker`] runs on its own named thread and follows the
//! barrier protocol below, which mirrors the orchestrator side in
//! [`Simulation`](crate::Simulation):
//!
//! ```text
//! initialize                      barrier  (end of init)
//! barrier  upload                 barrier  (upload window)
//! loop { barrier  execute command barrier }  until Quit
//! finalize                        barrier  (end of finalization)
//! ```
//!
//! A failed worker records its error, clears liveness and keeps
//! meeting barriers without executing anything, so that the
//! orchestrator can shut the run down without deadlocking. A panic in
//! any [`DeviceWorker`] call counts as a failure of that device. Any
//! barrier that returns [`BarrierOutcome::Unlocked`] ends the thread at
//! once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use hydra_core::{Command, CommandKind, DeviceIndex, WorkerError};
use tracing::{debug, error, warn};

use crate::barrier::{BarrierOutcome, Synchronizer};
use crate::error::RunError;
use crate::shared::SharedState;

/// One compute device.
///
/// Implementations own the device-side buffers. They read the host
/// arrays and layout from the [`SharedState`] and publish results in
/// their own [`DeviceReport`](crate::DeviceReport).
pub trait DeviceWorker: Send {
    /// Local index of the device.
    fn device(&self) -> DeviceIndex;

    /// Allocates device resources.
    fn initialize(&mut self, _shared: &SharedState) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Copies the device's partition from the host arrays.
    fn upload(&mut self, shared: &SharedState) -> Result<(), WorkerError>;

    /// Executes one posted command.
    fn execute(&mut self, command: &Command, shared: &SharedState) -> Result<(), WorkerError>;

    /// Releases device resources.
    fn finalize(&mut self, _shared: &SharedState) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// How a worker thread ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Left the command loop on `Quit` without failing.
    Finished {
        /// Commands executed, excluding `Quit`.
        commands: u64,
    },
    /// Left on `Quit` after a recorded failure.
    Failed {
        /// Commands executed before the failure, including the failing one.
        commands: u64,
    },
    /// Released by a force-unlock.
    Unlocked {
        /// Commands executed.
        commands: u64,
    },
    /// A worker call panicked. The thread kept meeting barriers until
    /// `Quit`.
    Panicked,
}

/// A spawned worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    device: DeviceIndex,
    thread: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Starts `worker` on a thread named after its device.
    pub fn spawn(
        mut worker: Box<dyn DeviceWorker>,
        shared: Arc<SharedState>,
        sync: Arc<Synchronizer>,
    ) -> Result<Self, RunError> {
        let device = worker.device();
        let thread = thread::Builder::new()
            .name(format!("hydra-device-{}", device.0))
            .spawn(move || run(worker.as_mut(), &shared, &sync))
            .map_err(|e| RunError::Spawn(e.to_string()))?;
        Ok(Self { device, thread })
    }

    /// The device driven by this thread.
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Waits for the thread to end.
    pub fn join(self) -> WorkerExit {
        self.thread.join().unwrap_or_else(|_| {
            warn!(device = self.device.0, "device worker panicked");
            WorkerExit::Panicked
        })
    }
}

struct Progress {
    commands: u64,
    failed: bool,
    panicked: bool,
}

impl Progress {
    fn unlocked(&self) -> WorkerExit {
        WorkerExit::Unlocked {
            commands: self.commands,
        }
    }

    fn fail(&mut self, shared: &SharedState, device: DeviceIndex, err: WorkerError) {
        shared.record_failure(device, err);
        self.failed = true;
    }

    // Runs one worker call, turning an error or a panic into a failure.
    fn attempt(
        &mut self,
        shared: &SharedState,
        device: DeviceIndex,
        stage: &str,
        call: impl FnOnce() -> Result<(), WorkerError>,
    ) {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(shared, device, e),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(device = device.0, stage, %reason, "device worker panicked");
                self.panicked = true;
                self.fail(
                    shared,
                    device,
                    WorkerError::Lifecycle {
                        device,
                        reason: format!("panicked during {stage}: {reason}"),
                    },
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn run(worker: &mut dyn DeviceWorker, shared: &SharedState, sync: &Synchronizer) -> WorkerExit {
    let device = worker.device();
    let mut progress = Progress {
        commands: 0,
        failed: false,
        panicked: false,
    };
    debug!(device = device.0, "device worker started");

    progress.attempt(shared, device, "initialize", || worker.initialize(shared));
    if sync.barrier() == BarrierOutcome::Unlocked {
        return progress.unlocked();
    }

    if sync.barrier() == BarrierOutcome::Unlocked {
        return progress.unlocked();
    }
    if !progress.failed {
        progress.attempt(shared, device, "upload", || worker.upload(shared));
    }
    if sync.barrier() == BarrierOutcome::Unlocked {
        return progress.unlocked();
    }

    loop {
        if sync.barrier() == BarrierOutcome::Unlocked {
            return progress.unlocked();
        }
        let command = shared.command();
        if command.kind == CommandKind::Quit {
            break;
        }
        if !progress.failed {
            progress.commands += 1;
            let stage = command.kind.name();
            progress.attempt(shared, device, stage, || worker.execute(&command, shared));
        }
        if sync.barrier() == BarrierOutcome::Unlocked {
            return progress.unlocked();
        }
    }

    if !progress.failed {
        progress.attempt(shared, device, "finalize", || worker.finalize(shared));
    }
    // End of finalization. Its outcome no longer matters.
    let _ = sync.barrier();
    debug!(device = device.0, commands = progress.commands, "device worker finished");
    if progress.panicked {
        WorkerExit::Panicked
    } else if progress.failed {
        WorkerExit::Failed {
            commands: progress.commands,
        }
    } else {
        WorkerExit::Finished {
            commands: progress.commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_arena::BufferList;
    use hydra_core::{GlobalDeviceId, NodeRank};
    use hydra_partition::{DeviceMap, Grid, Topology};

    use crate::dispatch::CommandDispatcher;
    use crate::shared::{Clock, DeviceLayout};

    struct Counting {
        device: DeviceIndex,
        fail_at: Option<u64>,
        seen: u64,
    }

    impl DeviceWorker for Counting {
        fn device(&self) -> DeviceIndex {
            self.device
        }

        fn upload(&mut self, shared: &SharedState) -> Result<(), WorkerError> {
            shared.report(self.device).internal_particles = 7;
            Ok(())
        }

        fn execute(&mut self, command: &Command, _shared: &SharedState) -> Result<(), WorkerError> {
            self.seen += 1;
            if Some(self.seen) == self.fail_at {
                return Err(WorkerError::execution(self.device, command.kind, "boom"));
            }
            Ok(())
        }
    }

    struct Panicking(DeviceIndex);

    impl DeviceWorker for Panicking {
        fn device(&self) -> DeviceIndex {
            self.0
        }

        fn upload(&mut self, _shared: &SharedState) -> Result<(), WorkerError> {
            Ok(())
        }

        fn execute(&mut self, _command: &Command, _shared: &SharedState) -> Result<(), WorkerError> {
            panic!("lost contact");
        }
    }

    fn shared(devices: usize) -> Arc<SharedState> {
        let grid = Grid::new([0.0; 3], [1.0; 3], [1, 1, 1]).unwrap();
        let map = DeviceMap::uniform(
            &grid,
            GlobalDeviceId::new(NodeRank::COORDINATOR, DeviceIndex(0)),
        );
        let state = SharedState::new(
            Topology::single_node(devices).unwrap(),
            grid,
            map,
            BufferList::new(0),
            DeviceLayout::single(0),
            Clock {
                t: 0.0,
                dt: 1.0,
                iteration: 0,
            },
        );
        state.set_keep_going(true);
        Arc::new(state)
    }

    fn spawn(
        shared: &Arc<SharedState>,
        sync: &Arc<Synchronizer>,
        fail_at: Option<u64>,
    ) -> Vec<WorkerHandle> {
        (0..shared.devices())
            .map(|d| {
                let worker = Box::new(Counting {
                    device: DeviceIndex(d as u8),
                    fail_at: if d == 1 { fail_at } else { None },
                    seen: 0,
                });
                WorkerHandle::spawn(worker, Arc::clone(shared), Arc::clone(sync)).unwrap()
            })
            .collect()
    }

    #[test]
    fn full_lifecycle() {
        let shared = shared(2);
        let sync = Arc::new(Synchronizer::new(3));
        let workers = spawn(&shared, &sync, None);
        let mut d = CommandDispatcher::new(Arc::clone(&shared), Arc::clone(&sync));

        assert!(sync.barrier().is_released());
        assert!(d.rendezvous().is_released());
        assert_eq!(shared.report(DeviceIndex(1)).internal_particles, 7);
        for _ in 0..5 {
            d.dispatch(Command::new(CommandKind::Euler)).unwrap();
        }
        assert!(d.post_quit().is_released());
        assert!(sync.barrier().is_released());
        for w in workers {
            assert_eq!(w.join(), WorkerExit::Finished { commands: 5 });
        }
    }

    #[test]
    fn failed_worker_keeps_meeting_barriers() {
        let shared = shared(2);
        let sync = Arc::new(Synchronizer::new(3));
        let workers = spawn(&shared, &sync, Some(2));
        let mut d = CommandDispatcher::new(Arc::clone(&shared), Arc::clone(&sync));

        sync.barrier();
        d.rendezvous();
        d.dispatch(Command::new(CommandKind::Euler)).unwrap();
        assert!(d.dispatch(Command::new(CommandKind::Euler)).is_err());
        assert!(shared.first_failure().is_some());

        d.post_quit();
        sync.barrier();
        let exits: Vec<_> = workers.into_iter().map(WorkerHandle::join).collect();
        assert_eq!(
            exits,
            vec![
                WorkerExit::Finished { commands: 2 },
                WorkerExit::Failed { commands: 2 },
            ]
        );
    }

    #[test]
    fn force_unlock_releases_workers() {
        let shared = shared(2);
        let sync = Arc::new(Synchronizer::new(3));
        let workers = spawn(&shared, &sync, None);
        sync.barrier();
        sync.force_unlock();
        for w in workers {
            assert_eq!(w.join(), WorkerExit::Unlocked { commands: 0 });
        }
    }

    #[test]
    fn panicking_worker_fails_and_keeps_meeting_barriers() {
        let shared = shared(2);
        let sync = Arc::new(Synchronizer::new(3));
        let healthy = WorkerHandle::spawn(
            Box::new(Counting {
                device: DeviceIndex(0),
                fail_at: None,
                seen: 0,
            }),
            Arc::clone(&shared),
            Arc::clone(&sync),
        )
        .unwrap();
        let panicking = WorkerHandle::spawn(
            Box::new(Panicking(DeviceIndex(1))),
            Arc::clone(&shared),
            Arc::clone(&sync),
        )
        .unwrap();
        let mut d = CommandDispatcher::new(Arc::clone(&shared), Arc::clone(&sync));

        sync.barrier();
        d.rendezvous();
        assert!(d.dispatch(Command::new(CommandKind::Euler)).is_err());
        match shared.first_failure() {
            Some(WorkerError::Lifecycle { device, reason }) => {
                assert_eq!(device, DeviceIndex(1));
                assert!(reason.contains("lost contact"), "{reason}");
            }
            other => panic!("expected a lifecycle failure, got {other:?}"),
        }

        assert!(d.post_quit().is_released());
        assert!(sync.barrier().is_released());
        assert_eq!(healthy.join(), WorkerExit::Finished { commands: 1 });
        assert_eq!(panicking.join(), WorkerExit::Panicked);
    }
}
