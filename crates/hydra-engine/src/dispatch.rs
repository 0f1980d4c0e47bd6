//! Two-barrier command handshake.
//!
//! Every dispatch posts one [`Command`] and then performs exactly two
//! rendezvous on the [`Synchronizer`]:
//!
//! 1. the first releases the workers to execute the posted command;
//! 2. the second returns once every worker has finished, so the
//!    orchestrator may read the reports.
//!
//! Liveness is checked after the second barrier. A cleared
//! `keep_going` flag turns into [`DispatchError::Aborted`], so no
//! command is ever posted after a worker has failed.

use std::sync::Arc;

use hydra_core::{BufferSet, Command, CommandFlags, CommandKind};
use tracing::trace;

use crate::barrier::{BarrierOutcome, Synchronizer};
use crate::error::DispatchError;
use crate::shared::{SharedState, Window};

/// Posts commands to the device workers and waits for their completion.
#[derive(Debug)]
pub struct CommandDispatcher {
    shared: Arc<SharedState>,
    sync: Arc<Synchronizer>,
    issued: u64,
}

impl CommandDispatcher {
    /// Creates a dispatcher over `shared` and `sync`.
    pub fn new(shared: Arc<SharedState>, sync: Arc<Synchronizer>) -> Self {
        Self {
            shared,
            sync,
            issued: 0,
        }
    }

    /// Runs `command` on every worker.
    pub fn dispatch(&mut self, command: Command) -> Result<(), DispatchError> {
        if !self.shared.keep_going() {
            return Err(DispatchError::NotRunning {
                command: command.kind,
            });
        }
        trace!(command = %command, "dispatch");
        self.shared.post(command);
        self.issued += 1;

        let outcome = self.rendezvous();
        if outcome == BarrierOutcome::Unlocked {
            return Err(DispatchError::Unlocked {
                command: command.kind,
            });
        }
        if !self.shared.keep_going() {
            return Err(DispatchError::Aborted {
                command: command.kind,
            });
        }
        Ok(())
    }

    /// Shorthand for a command with buffers and flags.
    pub fn issue(
        &mut self,
        kind: CommandKind,
        buffers: impl Into<BufferSet>,
        flags: CommandFlags,
    ) -> Result<(), DispatchError> {
        self.dispatch(Command::new(kind).on(buffers).with_flags(flags))
    }

    /// Runs the open/close handshake around the workers' window
    /// without posting a command. Used by the lifecycle barriers.
    pub fn rendezvous(&self) -> BarrierOutcome {
        self.shared.set_window(Window::Workers);
        let start = self.sync.barrier();
        let done = if start.is_released() {
            self.sync.barrier()
        } else {
            start
        };
        self.shared.set_window(Window::Orchestrator);
        done
    }

    /// Posts [`CommandKind::Quit`] regardless of liveness.
    ///
    /// Workers still parked on the start barrier leave their command
    /// loop once it releases; the caller must then meet them on the
    /// finalization barrier.
    pub fn post_quit(&mut self) -> BarrierOutcome {
        self.shared.post(Command::new(CommandKind::Quit));
        self.issued += 1;
        self.shared.set_window(Window::Workers);
        let outcome = self.sync.barrier();
        self.shared.set_window(Window::Orchestrator);
        outcome
    }

    /// A single barrier, outside any command.
    pub fn barrier(&self) -> BarrierOutcome {
        self.sync.barrier()
    }

    /// Releases every participant permanently.
    pub fn force_unlock(&self) {
        self.sync.force_unlock();
    }

    /// Commands posted so far, including `Quit`.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// The shared state.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }
}
