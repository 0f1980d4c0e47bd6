//! Partitioning error types.

use hydra_arena::ArenaError;
use thiserror::Error;

/// Errors raised while building maps or partitioning particles.
///
/// `InconsistentBuckets` and `VerificationFailed` indicate a broken
/// invariant rather than bad input; the run cannot continue after them.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// Node/device counts are out of the addressable range.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Human-readable cause.
        reason: String,
    },
    /// Grid dimensions are zero or exceed the cell index range.
    #[error("invalid grid: {reason}")]
    InvalidGrid {
        /// Human-readable cause.
        reason: String,
    },
    /// A particle hash points outside the device map.
    #[error("cell {cell} outside device map of {cells} cells")]
    CellOutOfRange {
        /// The offending cell index.
        cell: u32,
        /// Number of cells in the map.
        cells: usize,
    },
    /// The device map names a device the topology does not have.
    #[error("device map refers to unknown device {device}")]
    UnknownDevice {
        /// Display form of the offending device.
        device: String,
    },
    /// A slice histogram does not cover the split axis.
    #[error("histogram has {actual} slices, axis has {expected}")]
    HistogramMismatch {
        /// Number of cells along the axis.
        expected: usize,
        /// Number of histogram bins.
        actual: usize,
    },
    /// The right-cursor scan found no particle for a non-empty bucket.
    #[error("bucket {bucket}: no particle left to move into slot {slot}")]
    InconsistentBuckets {
        /// The bucket being filled.
        bucket: usize,
        /// The slot that could not be filled.
        slot: usize,
    },
    /// The post-sort self-check failed.
    #[error("partition verification failed: {reason}")]
    VerificationFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// Column access failed.
    #[error(transparent)]
    Arena(#[from] ArenaError),
}
