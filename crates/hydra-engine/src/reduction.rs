//! Cross-node collectives.
//!
//! The simulation loop needs four collectives: element-wise all-reduce
//! (sum, min, max), boolean OR, and all-gather of per-node counts.
//! Every one of them is expressed through the single required
//! [`Reduction::all_gather`] primitive. Calls are synchronous and never
//! overlap.
//!
//! [`SingleNode`] is the pass-through backend for one-node runs.
//! [`ThreadCluster`] runs several nodes as threads of one process.

use std::sync::{Arc, Mutex, PoisonError};

use crate::barrier::{BarrierOutcome, Synchronizer};
use crate::error::ReductionError;

/// Element-wise combining operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum.
    Sum,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl ReduceOp {
    fn fold(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Sum => acc + value,
            Self::Min => acc.min(value),
            Self::Max => acc.max(value),
        }
    }
}

/// Collective operations across all nodes of a run.
pub trait Reduction: Send {
    /// This node's rank.
    fn rank(&self) -> usize;

    /// Number of nodes.
    fn node_count(&self) -> usize;

    /// Gathers every node's `local` values, in rank order.
    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>, ReductionError>;

    /// Element-wise reduction of `values` across nodes, in place.
    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), ReductionError> {
        let gathered = self.all_gather(values)?;
        for (rank, contribution) in gathered.iter().enumerate() {
            if contribution.len() != values.len() {
                return Err(ReductionError::LengthMismatch {
                    rank,
                    expected: values.len(),
                    actual: contribution.len(),
                });
            }
        }
        for (i, slot) in values.iter_mut().enumerate() {
            let mut acc = gathered[0][i];
            for contribution in &gathered[1..] {
                acc = op.fold(acc, contribution[i]);
            }
            *slot = acc;
        }
        Ok(())
    }

    /// [`all_reduce_f64`](Reduction::all_reduce_f64) for `f32` values.
    fn all_reduce_f32(&self, values: &mut [f32], op: ReduceOp) -> Result<(), ReductionError> {
        let mut wide: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
        self.all_reduce_f64(&mut wide, op)?;
        for (v, w) in values.iter_mut().zip(wide) {
            *v = w as f32;
        }
        Ok(())
    }

    /// [`all_reduce_f64`](Reduction::all_reduce_f64) for `u32` values.
    fn all_reduce_u32(&self, values: &mut [u32], op: ReduceOp) -> Result<(), ReductionError> {
        let mut wide: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
        self.all_reduce_f64(&mut wide, op)?;
        for (v, w) in values.iter_mut().zip(wide) {
            *v = w as u32;
        }
        Ok(())
    }

    /// Logical OR of `flag` across nodes.
    fn all_reduce_bool(&self, flag: bool) -> Result<bool, ReductionError> {
        let mut v = [if flag { 1.0 } else { 0.0 }];
        self.all_reduce_f64(&mut v, ReduceOp::Max)?;
        Ok(v[0] > 0.0)
    }

    /// Every node's `local` count, in rank order.
    fn all_gather_counts(&self, local: usize) -> Result<Vec<usize>, ReductionError> {
        Ok(self
            .all_gather(&[local as f64])?
            .into_iter()
            .map(|v| v.first().copied().unwrap_or(0.0) as usize)
            .collect())
    }
}

// ── SingleNode ──────────────────────────────────────────────────────

/// Pass-through collectives for a one-node run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleNode;

impl Reduction for SingleNode {
    fn rank(&self) -> usize {
        0
    }

    fn node_count(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>, ReductionError> {
        Ok(vec![local.to_vec()])
    }
}

// ── ThreadCluster ───────────────────────────────────────────────────

#[derive(Debug)]
struct Exchange {
    sync: Synchronizer,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// One member of an in-process cluster of nodes.
///
/// Every member must take part in every collective, in the same order.
/// Each exchange costs two rendezvous: one after publishing, one after
/// reading, so a fast node cannot overwrite its slot while a slow one
/// is still gathering.
#[derive(Debug, Clone)]
pub struct ThreadCluster {
    rank: usize,
    nodes: usize,
    exchange: Arc<Exchange>,
}

impl ThreadCluster {
    /// Creates the members of a `nodes`-node cluster, in rank order.
    pub fn new(nodes: usize) -> Vec<ThreadCluster> {
        let nodes = nodes.max(1);
        let exchange = Arc::new(Exchange {
            sync: Synchronizer::new(nodes),
            slots: Mutex::new(vec![Vec::new(); nodes]),
        });
        (0..nodes)
            .map(|rank| ThreadCluster {
                rank,
                nodes,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    /// Abandons every pending and future collective of the cluster.
    pub fn abort(&self) {
        self.exchange.sync.force_unlock();
    }

    fn rendezvous(&self) -> Result<(), ReductionError> {
        match self.exchange.sync.barrier() {
            BarrierOutcome::Released => Ok(()),
            BarrierOutcome::Unlocked => Err(ReductionError::Unlocked),
        }
    }
}

impl Reduction for ThreadCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn node_count(&self) -> usize {
        self.nodes
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>, ReductionError> {
        {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(local);
        }
        self.rendezvous()?;
        let gathered = self
            .exchange
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.rendezvous()?;
        Ok(gathered)
    }
}
