//! Host-resident particle storage for Hydra.
//!
//! Particle data is stored column-wise: one [`HostColumn`] per
//! [`BufferKey`](hydra_core::BufferKey), all columns sharing a single
//! index space. Columns are either single-buffered or held in a
//! [`DoubleBuffer`] whose READ and WRITE roles are swapped, never copied.
//!
//! # Architecture
//!
//! ```text
//! BufferList (one per host, one per device)
//! ├── BufferKey::Pos  → Slot::Double(DoubleBuffer { read, write })
//! ├── BufferKey::Info → Slot::Double(...)
//! ├── BufferKey::Hash → Slot::Single(HostColumn::Hash(...))
//! └── ...
//! ```
//!
//! Reordering is expressed through one routine, [`Column::swap_elements`],
//! which [`BufferList::swap_elements`] applies to every registered column
//! and both sides of every double buffer. The partitioner relies on this
//! to keep all columns under the same permutation.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod column;
pub mod double;
pub mod error;
pub mod list;

pub use column::{Column, ColumnLayout, HostColumn, ParticleInfo, ParticleKind};
pub use double::DoubleBuffer;
pub use error::ArenaError;
pub use list::{BufferList, Multiplicity, Slot};
