//! Domain decomposition for Hydra.
//!
//! A [`Topology`] fixes how many devices each node drives. A [`Grid`]
//! maps particle positions to cells, and a [`DeviceMap`] assigns every
//! cell to a `(node, device)` pair. [`partition`] then reorders every
//! column of a [`BufferList`](hydra_arena::BufferList) in place so that
//! each device owns one contiguous index range.
//!
//! Buckets are ordered node-major: all devices of node 0, then all
//! devices of node 1, and so on.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod grid;
pub mod map;
pub mod sort;
pub mod topology;

pub use error::PartitionError;
pub use grid::Grid;
pub use map::DeviceMap;
pub use sort::{partition, PartitionReport};
pub use topology::Topology;
