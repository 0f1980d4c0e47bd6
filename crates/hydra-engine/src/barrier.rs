//! Reusable rendezvous barrier with a one-shot emergency release.
//!
//! Unlike [`std::sync::Barrier`], a [`Synchronizer`] can be
//! force-unlocked: every pending and every future [`barrier`] call
//! returns immediately with [`BarrierOutcome::Unlocked`]. This lets a
//! failed orchestrator release workers that would otherwise block
//! forever on the next rendezvous.
//!
//! [`barrier`]: Synchronizer::barrier

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// How a [`Synchronizer::barrier`] call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// All participants arrived.
    Released,
    /// The synchronizer was force-unlocked. The caller must stop
    /// participating in the protocol.
    Unlocked,
}

impl BarrierOutcome {
    /// Whether the rendezvous completed normally.
    pub fn is_released(self) -> bool {
        self == Self::Released
    }
}

#[derive(Debug)]
struct State {
    waiting: usize,
    generation: u64,
    unlocked: bool,
}

/// Barrier for a fixed number of participants.
#[derive(Debug)]
pub struct Synchronizer {
    participants: usize,
    state: Mutex<State>,
    cvar: Condvar,
}

impl Synchronizer {
    /// Creates a barrier for `participants` callers.
    ///
    /// A zero participant count is treated as one.
    pub fn new(participants: usize) -> Self {
        Self {
            participants: participants.max(1),
            state: Mutex::new(State {
                waiting: 0,
                generation: 0,
                unlocked: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Number of participants per rendezvous.
    pub fn participants(&self) -> usize {
        self.participants
    }

    // A panicking participant must not wedge the others: the state is
    // plain counters, valid at every point.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until all participants have called `barrier`, or until the
    /// synchronizer is force-unlocked.
    pub fn barrier(&self) -> BarrierOutcome {
        let mut state = self.lock();
        if state.unlocked {
            return BarrierOutcome::Unlocked;
        }
        state.waiting += 1;
        if state.waiting == self.participants {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return BarrierOutcome::Released;
        }
        let generation = state.generation;
        while state.generation == generation && !state.unlocked {
            state = self.cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation != generation {
            BarrierOutcome::Released
        } else {
            BarrierOutcome::Unlocked
        }
    }

    /// Permanently releases every pending and future barrier call.
    pub fn force_unlock(&self) {
        let mut state = self.lock();
        state.unlocked = true;
        self.cvar.notify_all();
    }

    /// Whether [`force_unlock`](Self::force_unlock) has been called.
    pub fn is_unlocked(&self) -> bool {
        self.lock().unlocked
    }

    /// Completed rendezvous count.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_participant_never_blocks() {
        let sync = Synchronizer::new(1);
        for _ in 0..3 {
            assert_eq!(sync.barrier(), BarrierOutcome::Released);
        }
        assert_eq!(sync.generation(), 3);
    }

    #[test]
    fn releases_all_participants_together() {
        let sync = Arc::new(Synchronizer::new(4));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || (0..50).map(|_| sync.barrier()).collect::<Vec<_>>())
            })
            .collect();
        for _ in 0..50 {
            assert!(sync.barrier().is_released());
        }
        for h in handles {
            assert!(h.join().unwrap().iter().all(|o| o.is_released()));
        }
        assert_eq!(sync.generation(), 50);
    }

    #[test]
    fn force_unlock_releases_pending_waiters() {
        let sync = Arc::new(Synchronizer::new(3));
        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.barrier())
        };
        thread::sleep(Duration::from_millis(20));
        sync.force_unlock();
        assert_eq!(waiter.join().unwrap(), BarrierOutcome::Unlocked);
    }

    #[test]
    fn unlock_is_permanent() {
        let sync = Synchronizer::new(2);
        sync.force_unlock();
        assert!(sync.is_unlocked());
        for _ in 0..5 {
            assert_eq!(sync.barrier(), BarrierOutcome::Unlocked);
        }
    }

    #[test]
    fn zero_participants_behaves_as_one() {
        let sync = Synchronizer::new(0);
        assert_eq!(sync.participants(), 1);
        assert!(sync.barrier().is_released());
    }
}
