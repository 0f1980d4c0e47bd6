//! Particle buffer keys and the [`BufferSet`] bitset.
//!
//! Every per-particle column has a [`BufferKey`]. Commands name the
//! columns they operate on with a [`BufferSet`], optionally narrowed
//! to the READ or WRITE side of double-buffered columns.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Identifies one per-particle column.
///
/// The discriminant is the bit position inside a [`BufferSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BufferKey {
    /// Position (xyz) and mass (w).
    Pos = 0,
    /// Velocity (xyz) and density (w).
    Vel = 1,
    /// Particle type, flags, and identity.
    Info = 2,
    /// Spatial hash.
    Hash = 3,
    /// Global (double precision) position, host only.
    PosGlobal = 4,
    /// Computed forces.
    Forces = 5,
    /// SPS stress tensor.
    Tau = 6,
    /// Grenier sigma.
    Sigma = 7,
    /// Grenier particle volume.
    Volume = 8,
    /// Turbulent kinetic energy.
    Tke = 9,
    /// Turbulent dissipation.
    Epsilon = 10,
    /// k-epsilon turbulent viscosity.
    TurbVisc = 11,
    /// SPS turbulent viscosity.
    SpsTurbVisc = 12,
    /// Eulerian velocity at open boundaries.
    EulerVel = 13,
    /// Semi-analytical gamma gradient.
    GradGamma = 14,
    /// Semi-analytical vertex connectivity.
    Vertices = 15,
    /// Semi-analytical boundary element normals.
    BoundElements = 16,
    /// Internal energy.
    InternalEnergy = 17,
    /// Relative vertex positions.
    VertPos = 18,
    /// Neighbour list, debug dumps only.
    NeibsList = 19,
    /// Surface normals from post-processing.
    Normals = 20,
    /// Vorticity from post-processing.
    Vorticity = 21,
}

impl BufferKey {
    /// Every key, in bit order.
    pub const ALL: [BufferKey; 22] = [
        Self::Pos,
        Self::Vel,
        Self::Info,
        Self::Hash,
        Self::PosGlobal,
        Self::Forces,
        Self::Tau,
        Self::Sigma,
        Self::Volume,
        Self::Tke,
        Self::Epsilon,
        Self::TurbVisc,
        Self::SpsTurbVisc,
        Self::EulerVel,
        Self::GradGamma,
        Self::Vertices,
        Self::BoundElements,
        Self::InternalEnergy,
        Self::VertPos,
        Self::NeibsList,
        Self::Normals,
        Self::Vorticity,
    ];

    /// Short lowercase name used in logs and by output sinks.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pos => "pos",
            Self::Vel => "vel",
            Self::Info => "info",
            Self::Hash => "hash",
            Self::PosGlobal => "pos_global",
            Self::Forces => "forces",
            Self::Tau => "tau",
            Self::Sigma => "sigma",
            Self::Volume => "volume",
            Self::Tke => "tke",
            Self::Epsilon => "epsilon",
            Self::TurbVisc => "turbvisc",
            Self::SpsTurbVisc => "sps_turbvisc",
            Self::EulerVel => "eulervel",
            Self::GradGamma => "gradgamma",
            Self::Vertices => "vertices",
            Self::BoundElements => "boundelements",
            Self::InternalEnergy => "internal_energy",
            Self::VertPos => "vertpos",
            Self::NeibsList => "neibslist",
            Self::Normals => "normals",
            Self::Vorticity => "vorticity",
        }
    }

    fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of a double-buffered column a command targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferSide {
    /// The authoritative, most recently published values.
    Read,
    /// The staging side that the current stage writes into.
    Write,
}

/// A set of [`BufferKey`]s plus an optional [`BufferSide`] selector.
///
/// Backed by a single `u64`: key bits occupy the low positions, the two
/// side selectors occupy the top two bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferSet {
    bits: u64,
}

impl BufferSet {
    const READ_BIT: u64 = 1 << 62;
    const WRITE_BIT: u64 = 1 << 63;
    const KEY_MASK: u64 = !(Self::READ_BIT | Self::WRITE_BIT);

    /// Buffers refreshed on neighbouring devices after a force pass.
    pub const POST_FORCES_UPDATE: BufferSet = BufferSet::from_bits(
        (1 << BufferKey::Forces as u8) | (1 << BufferKey::Tau as u8),
    );

    /// Buffers swapped at the end of each integration stage.
    pub const POST_COMPUTE_SWAP: BufferSet = BufferSet::from_bits(
        (1 << BufferKey::Pos as u8)
            | (1 << BufferKey::Vel as u8)
            | (1 << BufferKey::Volume as u8)
            | (1 << BufferKey::Tke as u8)
            | (1 << BufferKey::Epsilon as u8)
            | (1 << BufferKey::EulerVel as u8)
            | (1 << BufferKey::GradGamma as u8)
            | (1 << BufferKey::Vertices as u8)
            | (1 << BufferKey::InternalEnergy as u8),
    );

    /// Buffers refreshed after the semi-analytical segment pass.
    pub const POST_SA_SEGMENT_UPDATE: BufferSet = BufferSet::from_bits(
        (1 << BufferKey::Pos as u8)
            | (1 << BufferKey::Vel as u8)
            | (1 << BufferKey::Tke as u8)
            | (1 << BufferKey::Epsilon as u8)
            | (1 << BufferKey::EulerVel as u8)
            | (1 << BufferKey::GradGamma as u8)
            | (1 << BufferKey::Vertices as u8),
    );

    /// Buffers refreshed after the semi-analytical vertex pass.
    pub const POST_SA_VERTEX_UPDATE: BufferSet = BufferSet::from_bits(
        (1 << BufferKey::Pos as u8)
            | (1 << BufferKey::Vel as u8)
            | (1 << BufferKey::Tke as u8)
            | (1 << BufferKey::Epsilon as u8)
            | (1 << BufferKey::EulerVel as u8),
    );

    /// Buffers copied from neighbouring devices when appending halo cells.
    pub const IMPORT_BUFFERS: BufferSet = BufferSet::from_bits(
        (1 << BufferKey::Pos as u8)
            | (1 << BufferKey::Vel as u8)
            | (1 << BufferKey::Info as u8)
            | (1 << BufferKey::Hash as u8)
            | (1 << BufferKey::Volume as u8)
            | (1 << BufferKey::Tke as u8)
            | (1 << BufferKey::Epsilon as u8)
            | (1 << BufferKey::TurbVisc as u8)
            | (1 << BufferKey::EulerVel as u8)
            | (1 << BufferKey::GradGamma as u8)
            | (1 << BufferKey::Vertices as u8)
            | (1 << BufferKey::BoundElements as u8)
            | (1 << BufferKey::InternalEnergy as u8),
    );

    const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// The empty set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Set containing exactly one key.
    pub const fn single(key: BufferKey) -> Self {
        Self {
            bits: 1 << key as u8,
        }
    }

    /// Every buffer key.
    pub fn all() -> Self {
        BufferKey::ALL.into_iter().collect()
    }

    /// Set containing the given keys.
    pub fn of(keys: &[BufferKey]) -> Self {
        keys.iter().copied().collect()
    }

    /// Insert a key.
    pub fn insert(&mut self, key: BufferKey) {
        self.bits |= key.bit();
    }

    /// Builder-style insert.
    pub fn with(mut self, key: BufferKey) -> Self {
        self.insert(key);
        self
    }

    /// Whether the set contains `key`.
    pub fn contains(&self, key: BufferKey) -> bool {
        self.bits & key.bit() != 0
    }

    /// Whether no key is selected (the side selector is ignored).
    pub fn is_empty(&self) -> bool {
        self.bits & Self::KEY_MASK == 0
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        (self.bits & Self::KEY_MASK).count_ones() as usize
    }

    /// Union of the key bits; side selectors are combined as well.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Keys present in both sets. The selector of `self` is kept.
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            bits: (self.bits & other.bits & Self::KEY_MASK) | (self.bits & !Self::KEY_MASK),
        }
    }

    /// Keys in `self` that are not in `other`. The selector of `self` is kept.
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            bits: self.bits & !(other.bits & Self::KEY_MASK),
        }
    }

    /// Select the READ side of double-buffered columns.
    pub fn read(self) -> Self {
        Self {
            bits: (self.bits & Self::KEY_MASK) | Self::READ_BIT,
        }
    }

    /// Select the WRITE side of double-buffered columns.
    pub fn write(self) -> Self {
        Self {
            bits: (self.bits & Self::KEY_MASK) | Self::WRITE_BIT,
        }
    }

    /// The side selector, if any.
    pub fn side(&self) -> Option<BufferSide> {
        if self.bits & Self::WRITE_BIT != 0 {
            Some(BufferSide::Write)
        } else if self.bits & Self::READ_BIT != 0 {
            Some(BufferSide::Read)
        } else {
            None
        }
    }

    /// Same keys, no side selector.
    pub fn keys_only(&self) -> Self {
        Self {
            bits: self.bits & Self::KEY_MASK,
        }
    }

    /// Iterate over the keys in bit order.
    pub fn iter(&self) -> impl Iterator<Item = BufferKey> + '_ {
        BufferKey::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for key in self.iter() {
            list.entry(&key);
        }
        list.finish()?;
        match self.side() {
            Some(BufferSide::Read) => f.write_str("@read"),
            Some(BufferSide::Write) => f.write_str("@write"),
            None => Ok(()),
        }
    }
}

impl FromIterator<BufferKey> for BufferSet {
    fn from_iter<I: IntoIterator<Item = BufferKey>>(iter: I) -> Self {
        let mut set = Self::empty();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl From<BufferKey> for BufferSet {
    fn from(key: BufferKey) -> Self {
        Self::single(key)
    }
}

impl BitOr for BufferSet {
    type Output = BufferSet;

    fn bitor(self, rhs: BufferSet) -> BufferSet {
        self.union(&rhs)
    }
}

impl BitOr<BufferKey> for BufferSet {
    type Output = BufferSet;

    fn bitor(self, rhs: BufferKey) -> BufferSet {
        self.with(rhs)
    }
}

impl BitOr for BufferKey {
    type Output = BufferSet;

    fn bitor(self, rhs: BufferKey) -> BufferSet {
        BufferSet::single(self).with(rhs)
    }
}

impl BitOrAssign<BufferKey> for BufferSet {
    fn bitor_assign(&mut self, rhs: BufferKey) {
        self.insert(rhs);
    }
}

impl BitOrAssign for BufferSet {
    fn bitor_assign(&mut self, rhs: BufferSet) {
        *self = self.union(&rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_buffer_set() -> impl Strategy<Value = BufferSet> {
        prop::collection::vec(0usize..BufferKey::ALL.len(), 0..12)
            .prop_map(|idx| idx.into_iter().map(|i| BufferKey::ALL[i]).collect())
    }

    #[test]
    fn operator_composition_builds_sets() {
        let set = BufferKey::Pos | BufferKey::Vel | BufferKey::Info;
        assert_eq!(set.len(), 3);
        assert!(set.contains(BufferKey::Vel));
        assert!(!set.contains(BufferKey::Hash));
    }

    #[test]
    fn side_selector_does_not_count_as_key() {
        let set = BufferSet::single(BufferKey::Pos).write();
        assert_eq!(set.len(), 1);
        assert_eq!(set.side(), Some(BufferSide::Write));
        assert_eq!(set.read().side(), Some(BufferSide::Read));
        assert_eq!(set.keys_only().side(), None);
        assert!(BufferSet::empty().write().is_empty());
    }

    #[test]
    fn all_contains_every_key() {
        let all = BufferSet::all();
        assert_eq!(all.len(), BufferKey::ALL.len());
        assert_eq!(all.side(), None);
    }

    #[test]
    fn iter_yields_keys_in_bit_order() {
        let set = BufferKey::Hash | BufferKey::Pos;
        let keys: Vec<_> = set.iter().collect();
        assert_eq!(keys, vec![BufferKey::Pos, BufferKey::Hash]);
    }

    #[test]
    fn debug_lists_keys_and_side() {
        let set = (BufferKey::Pos | BufferKey::Vel).read();
        assert_eq!(format!("{set:?}"), "{Pos, Vel}@read");
    }

    proptest! {
        #[test]
        fn union_commutative(a in arb_buffer_set(), b in arb_buffer_set()) {
            prop_assert_eq!(a.union(&b), b.union(&a));
        }

        #[test]
        fn difference_removes_common(a in arb_buffer_set(), b in arb_buffer_set()) {
            let diff = a.difference(&b);
            for key in diff.iter() {
                prop_assert!(a.contains(key));
                prop_assert!(!b.contains(key));
            }
        }

        #[test]
        fn len_matches_iter_count(a in arb_buffer_set()) {
            prop_assert_eq!(a.len(), a.iter().count());
        }

        #[test]
        fn selector_preserves_keys(a in arb_buffer_set()) {
            prop_assert_eq!(a.read().keys_only(), a);
            prop_assert_eq!(a.write().keys_only(), a);
        }
    }
}
