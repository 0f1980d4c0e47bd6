//! Strongly-typed identifiers for devices, nodes, particles, and cells.

use std::fmt;

/// Index of a compute device within the local node.
///
/// Devices are numbered densely from zero in the order their workers
/// were spawned. At most [`GlobalDeviceId::MAX_DEVICES_PER_NODE`]
/// devices fit in one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub u8);

impl DeviceIndex {
    /// The device index as a `usize`, for indexing per-device tables.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a node process in a multi-node run. Rank 0 is the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRank(pub u8);

impl NodeRank {
    /// The coordinating node.
    pub const COORDINATOR: NodeRank = NodeRank(0);

    /// Whether this is the coordinating node.
    pub fn is_coordinator(self) -> bool {
        self.0 == 0
    }

    /// The rank as a `usize`, for indexing per-node tables.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(node, device)` pair packed into one byte.
///
/// The low [`DEVICE_BITS`](Self::DEVICE_BITS) bits hold the device
/// index, the remaining high bits hold the node rank. This is the value
/// stored per cell in the device map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalDeviceId(pub u8);

impl GlobalDeviceId {
    /// Number of low bits reserved for the device index.
    pub const DEVICE_BITS: u32 = 3;
    /// Maximum number of devices addressable on one node.
    pub const MAX_DEVICES_PER_NODE: usize = 1 << Self::DEVICE_BITS;
    /// Maximum number of nodes addressable in one run.
    pub const MAX_NODES: usize = 1 << (8 - Self::DEVICE_BITS);

    const DEVICE_MASK: u8 = (1 << Self::DEVICE_BITS) - 1;

    /// Pack a node rank and a device index.
    ///
    /// Out-of-range components are masked; callers validate topology
    /// sizes up front (see `Topology::new` in `hydra-partition`).
    pub fn new(rank: NodeRank, device: DeviceIndex) -> Self {
        Self((rank.0 << Self::DEVICE_BITS) | (device.0 & Self::DEVICE_MASK))
    }

    /// The node rank component.
    pub fn rank(self) -> NodeRank {
        NodeRank(self.0 >> Self::DEVICE_BITS)
    }

    /// The device index component.
    pub fn device(self) -> DeviceIndex {
        DeviceIndex(self.0 & Self::DEVICE_MASK)
    }
}

impl fmt::Display for GlobalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}d{}", self.rank(), self.device())
    }
}

/// Stable identity of a particle for the whole run.
///
/// Identities are unique across all nodes. Particles created at open
/// boundaries receive freshly allocated identities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(pub u32);

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a cell relative to the device that holds it.
///
/// Stored in the top bits of a [`CellHash`] once the workers have
/// classified their cells after a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CellType {
    /// Owned by this device, no foreign neighbours.
    Inner = 0,
    /// Owned by this device, adjacent to a foreign cell.
    InnerEdge = 1,
    /// Owned by another device, adjacent to one of ours.
    OuterEdge = 2,
    /// Owned by another device, not adjacent to any of ours.
    Outer = 3,
}

/// Linearized grid cell index plus [`CellType`] tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellHash(pub u32);

impl CellHash {
    /// Number of high bits holding the [`CellType`] tag.
    pub const CELLTYPE_BITS: u32 = 2;
    /// Shift of the [`CellType`] tag.
    pub const CELLTYPE_SHIFT: u32 = 32 - Self::CELLTYPE_BITS;
    /// Mask selecting the linear cell index.
    pub const CELL_MASK: u32 = (1 << Self::CELLTYPE_SHIFT) - 1;
    /// Largest representable number of grid cells.
    pub const MAX_CELLS: u32 = Self::CELL_MASK;

    /// The linear cell index, without the type tag.
    pub fn index(self) -> u32 {
        self.0 & Self::CELL_MASK
    }

    /// The cell type tag.
    pub fn cell_type(self) -> CellType {
        match self.0 >> Self::CELLTYPE_SHIFT {
            0 => CellType::Inner,
            1 => CellType::InnerEdge,
            2 => CellType::OuterEdge,
            _ => CellType::Outer,
        }
    }

    /// Same cell index with a different type tag.
    pub fn with_type(self, cell_type: CellType) -> Self {
        Self(self.index() | ((cell_type as u32) << Self::CELLTYPE_SHIFT))
    }
}

impl fmt::Display for CellHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Per-particle spatial hash.
///
/// The high 32 bits carry the [`CellHash`]; the low 32 bits carry the
/// particle's identity so that sorting by hash is stable within a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleHash(pub u64);

impl ParticleHash {
    /// Build a hash from a cell and a particle identity.
    pub fn new(cell: CellHash, id: ParticleId) -> Self {
        Self(((cell.0 as u64) << 32) | id.0 as u64)
    }

    /// The cell hash, with any type tag stripped.
    pub fn cell_hash(self) -> CellHash {
        CellHash(((self.0 >> 32) as u32) & CellHash::CELL_MASK)
    }

    /// The cell hash including its type tag.
    pub fn tagged_cell_hash(self) -> CellHash {
        CellHash((self.0 >> 32) as u32)
    }
}
