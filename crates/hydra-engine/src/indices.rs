//! Recompute device offsets and particle totals from ground truth.
//!
//! After every redistribution each device reports its own internal
//! particle count. Offsets are rebuilt from those counts, never
//! patched incrementally: node counts are all-gathered, this node's
//! offset is the sum of the counts of lower ranks, and device starts
//! follow as prefix sums.

use smallvec::SmallVec;
use tracing::{error, warn};

use crate::error::ReductionError;
use crate::reduction::Reduction;
use crate::shared::{DeviceLayout, SharedState};

/// Policy inputs of [`update_array_indices`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Open boundaries may legitimately change the total.
    pub inlet_outlet: bool,
    /// Do not warn when the total shrinks.
    pub no_leak_warning: bool,
    /// Particles a node can hold.
    pub capacity: usize,
}

/// Outcome of one reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    /// Particles on this node.
    pub process_count: usize,
    /// Total before reconciling.
    pub previous_total: usize,
    /// Total across all nodes after reconciling.
    pub total: usize,
    /// The coordinator saw a change that open boundaries do not explain.
    pub unexplained: bool,
    /// Some node holds more particles than its capacity.
    pub capacity_exceeded: bool,
}

/// Rebuilds the device layout in `shared` from the device reports.
///
/// Only the coordinator judges total changes. A change is expected
/// with open boundaries and is applied silently. Otherwise growth
/// always warns and shrinkage warns unless `no_leak_warning` is set.
/// A node exceeding its capacity logs an error. The flag is then
/// OR-reduced, so every node requests termination in the same
/// iteration and none is left waiting in a later collective.
pub fn update_array_indices(
    shared: &SharedState,
    reduction: &dyn Reduction,
    options: ReconcileOptions,
    iteration: u64,
) -> Result<Reconciliation, ReductionError> {
    let counts: SmallVec<[usize; 8]> = shared
        .reports()
        .iter()
        .map(|r| r.internal_particles)
        .collect();
    let process_count: usize = counts.iter().sum();

    let node_counts = reduction.all_gather_counts(process_count)?;
    let rank = reduction.rank();
    let offset: usize = node_counts.iter().take(rank).sum();
    let mut starts = SmallVec::with_capacity(counts.len());
    let mut at = offset;
    for &c in &counts {
        starts.push(at);
        at += c;
    }

    let previous_total = shared.layout().total;
    let total: usize = node_counts.iter().sum();
    let mut unexplained = false;
    if total != previous_total && rank == 0 && !options.inlet_outlet {
        let grew = total > previous_total;
        if grew || !options.no_leak_warning {
            warn!(
                iteration,
                previous = previous_total,
                total,
                "particle count changed without open boundaries"
            );
            unexplained = true;
        }
    }

    shared.set_layout(DeviceLayout {
        starts,
        counts,
        node_counts,
        total,
    });

    let local_exceeded = process_count > options.capacity;
    if local_exceeded {
        error!(
            iteration,
            particles = process_count,
            capacity = options.capacity,
            "FATAL: particle count exceeds the allocated capacity"
        );
    }
    let capacity_exceeded = reduction.all_reduce_bool(local_exceeded)?;
    if capacity_exceeded {
        shared.request_quit();
    }

    Ok(Reconciliation {
        process_count,
        previous_total,
        total,
        unexplained,
        capacity_exceeded,
    })
}
