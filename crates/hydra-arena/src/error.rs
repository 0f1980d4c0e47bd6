//! Arena error types.

use hydra_core::BufferKey;
use thiserror::Error;

use crate::column::ColumnLayout;

/// Errors raised by column storage.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The buffer is not registered in this list.
    #[error("buffer {key} is not registered")]
    UnknownBuffer {
        /// The missing buffer.
        key: BufferKey,
    },
    /// A role swap or WRITE access was requested on a single-buffered column.
    #[error("buffer {key} is not double-buffered")]
    NotDoubleBuffered {
        /// The offending buffer.
        key: BufferKey,
    },
    /// A column was inserted with a length different from the list's.
    #[error("buffer {key} has {actual} elements, list holds {expected}")]
    LengthMismatch {
        /// The offending buffer.
        key: BufferKey,
        /// The list's particle count.
        expected: usize,
        /// The column's length.
        actual: usize,
    },
    /// Two columns of different element types were combined.
    #[error("buffer {key}: layout {actual:?} does not match {expected:?}")]
    LayoutMismatch {
        /// The offending buffer.
        key: BufferKey,
        /// The layout required.
        expected: ColumnLayout,
        /// The layout found.
        actual: ColumnLayout,
    },
    /// An index or range end fell outside a column.
    #[error("buffer {key}: index {index} out of bounds for length {len}")]
    OutOfBounds {
        /// The offending buffer.
        key: BufferKey,
        /// The first out-of-range index.
        index: usize,
        /// The column length.
        len: usize,
    },
}
