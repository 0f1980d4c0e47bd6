//! Integration test: the synchronizer keeps phases apart and never
//! strands a participant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use hydra_engine::{BarrierOutcome, Synchronizer};
use proptest::prelude::*;

/// Every participant bumps a shared counter once per round. After each
/// rendezvous the counter must show exactly the arrivals of all
/// completed rounds.
fn phase_counts(participants: usize, rounds: usize) -> Vec<Vec<usize>> {
    let sync = Arc::new(Synchronizer::new(participants));
    let arrivals = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..participants)
        .map(|_| {
            let sync = Arc::clone(&sync);
            let arrivals = Arc::clone(&arrivals);
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(rounds);
                for _ in 0..rounds {
                    arrivals.fetch_add(1, Ordering::SeqCst);
                    assert!(sync.barrier().is_released());
                    seen.push(arrivals.load(Ordering::SeqCst));
                    // Nobody may start the next round before all have read.
                    assert!(sync.barrier().is_released());
                }
                seen
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn rounds_never_overlap(participants in 1usize..6, rounds in 1usize..20) {
        for seen in phase_counts(participants, rounds) {
            let expected: Vec<usize> = (1..=rounds).map(|r| r * participants).collect();
            prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn unlock_frees_everyone(participants in 2usize..6, rounds in 0usize..10) {
        let sync = Arc::new(Synchronizer::new(participants));
        // All but one participant loop until released by the unlock.
        let handles: Vec<_> = (1..participants)
            .map(|_| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || {
                    let mut completed = 0usize;
                    while sync.barrier() == BarrierOutcome::Released {
                        completed += 1;
                    }
                    completed
                })
            })
            .collect();
        for _ in 0..rounds {
            prop_assert!(sync.barrier().is_released());
        }
        sync.force_unlock();
        for h in handles {
            prop_assert_eq!(h.join().unwrap(), rounds);
        }
        prop_assert_eq!(sync.generation(), rounds as u64);
        prop_assert_eq!(sync.barrier(), BarrierOutcome::Unlocked);
    }
}
