//! Named column set sharing one particle index space.

use std::ops::Range;

use hydra_core::{BufferKey, BufferSet, ParticleHash};
use indexmap::IndexMap;

use crate::column::{Column, ColumnLayout, HostColumn, ParticleInfo};
use crate::double::DoubleBuffer;
use crate::error::ArenaError;

/// Whether a buffer is registered with one or two storages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Multiplicity {
    /// One storage, read and written in place.
    Single,
    /// READ and WRITE storages with swappable roles.
    Double,
}

/// Storage for one registered buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    /// Single-buffered column.
    Single(HostColumn),
    /// Double-buffered column.
    Double(DoubleBuffer),
}

impl Slot {
    fn zeroed(layout: ColumnLayout, multiplicity: Multiplicity, len: usize) -> Self {
        match multiplicity {
            Multiplicity::Single => Self::Single(HostColumn::zeroed(layout, len)),
            Multiplicity::Double => Self::Double(DoubleBuffer::zeroed(layout, len)),
        }
    }

    /// The authoritative storage.
    pub fn read(&self) -> &HostColumn {
        match self {
            Self::Single(c) => c,
            Self::Double(d) => d.read(),
        }
    }

    /// Mutable authoritative storage.
    pub fn read_mut(&mut self) -> &mut HostColumn {
        match self {
            Self::Single(c) => c,
            Self::Double(d) => d.read_mut(),
        }
    }

    /// The double buffer, if this slot has one.
    pub fn as_double_mut(&mut self) -> Option<&mut DoubleBuffer> {
        match self {
            Self::Single(_) => None,
            Self::Double(d) => Some(d),
        }
    }

    /// Single or double.
    pub fn multiplicity(&self) -> Multiplicity {
        match self {
            Self::Single(_) => Multiplicity::Single,
            Self::Double(_) => Multiplicity::Double,
        }
    }

    /// Element layout.
    pub fn layout(&self) -> ColumnLayout {
        self.read().layout()
    }
}

impl Column for Slot {
    fn len(&self) -> usize {
        self.read().len()
    }

    fn swap_elements(&mut self, i: usize, j: usize) {
        match self {
            Self::Single(c) => c.swap_elements(i, j),
            Self::Double(d) => d.swap_elements(i, j),
        }
    }

    fn resize(&mut self, len: usize) {
        match self {
            Self::Single(c) => c.resize(len),
            Self::Double(d) => d.resize(len),
        }
    }
}

/// All particle columns of one host or device, keyed by [`BufferKey`].
///
/// Every column has exactly [`len`](Self::len) elements. Iteration
/// follows registration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferList {
    len: usize,
    slots: IndexMap<BufferKey, Slot>,
}

impl BufferList {
    /// An empty list for `len` particles.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            slots: IndexMap::new(),
        }
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list holds no particles.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a zero-filled buffer. Re-registering keeps the existing data.
    pub fn register(&mut self, key: BufferKey, multiplicity: Multiplicity) -> &mut Slot {
        let len = self.len;
        self.slots
            .entry(key)
            .or_insert_with(|| Slot::zeroed(ColumnLayout::of(key), multiplicity, len))
    }

    /// Register every key of `set` with the same multiplicity.
    pub fn register_all(&mut self, set: BufferSet, multiplicity: Multiplicity) {
        for key in set.iter() {
            self.register(key, multiplicity);
        }
    }

    /// Insert pre-filled storage, replacing any existing buffer.
    pub fn insert(&mut self, key: BufferKey, slot: Slot) -> Result<(), ArenaError> {
        if slot.len() != self.len {
            return Err(ArenaError::LengthMismatch {
                key,
                expected: self.len,
                actual: slot.len(),
            });
        }
        let expected = ColumnLayout::of(key);
        if slot.layout() != expected {
            return Err(ArenaError::LayoutMismatch {
                key,
                expected,
                actual: slot.layout(),
            });
        }
        self.slots.insert(key, slot);
        Ok(())
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: BufferKey) -> bool {
        self.slots.contains_key(&key)
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = BufferKey> + '_ {
        self.slots.keys().copied()
    }

    /// Registered keys as a set.
    pub fn key_set(&self) -> BufferSet {
        self.keys().collect()
    }

    /// Storage for `key`.
    pub fn slot(&self, key: BufferKey) -> Result<&Slot, ArenaError> {
        self.slots.get(&key).ok_or(ArenaError::UnknownBuffer { key })
    }

    /// Mutable storage for `key`.
    pub fn slot_mut(&mut self, key: BufferKey) -> Result<&mut Slot, ArenaError> {
        self.slots
            .get_mut(&key)
            .ok_or(ArenaError::UnknownBuffer { key })
    }

    /// READ side of `key`.
    pub fn read(&self, key: BufferKey) -> Result<&HostColumn, ArenaError> {
        Ok(self.slot(key)?.read())
    }

    /// Mutable READ side of `key`.
    pub fn read_mut(&mut self, key: BufferKey) -> Result<&mut HostColumn, ArenaError> {
        Ok(self.slot_mut(key)?.read_mut())
    }

    /// The double buffer for `key`.
    pub fn double_mut(&mut self, key: BufferKey) -> Result<&mut DoubleBuffer, ArenaError> {
        self.slot_mut(key)?
            .as_double_mut()
            .ok_or(ArenaError::NotDoubleBuffered { key })
    }

    /// Exchange READ and WRITE roles for every registered key in `set`.
    ///
    /// Keys not registered in this list are skipped. A registered
    /// single-buffered key is an error and leaves earlier swaps applied.
    pub fn swap_roles(&mut self, set: BufferSet) -> Result<(), ArenaError> {
        for key in set.iter() {
            match self.slots.get_mut(&key) {
                None => continue,
                Some(Slot::Double(d)) => d.swap(),
                Some(Slot::Single(_)) => return Err(ArenaError::NotDoubleBuffered { key }),
            }
        }
        Ok(())
    }

    /// Exchange particles `i` and `j` in every column and on both sides
    /// of every double buffer.
    pub fn swap_elements(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        for slot in self.slots.values_mut() {
            slot.swap_elements(i, j);
        }
    }

    /// Grow or shrink every column to `len` particles.
    pub fn resize(&mut self, len: usize) {
        self.len = len;
        for slot in self.slots.values_mut() {
            slot.resize(len);
        }
    }

    /// Copy the READ side of `src[range]` into the READ side of
    /// `self[dst_start..]` for every key of `keys` registered in both lists.
    pub fn copy_range_from(
        &mut self,
        src: &BufferList,
        keys: BufferSet,
        range: Range<usize>,
        dst_start: usize,
    ) -> Result<(), ArenaError> {
        for key in keys.iter() {
            let (Some(dst), Some(from)) = (self.slots.get_mut(&key), src.slots.get(&key)) else {
                continue;
            };
            dst.read_mut()
                .copy_range_from(key, from.read(), range.clone(), dst_start)?;
        }
        Ok(())
    }

    fn typed<'a, T>(
        &'a self,
        key: BufferKey,
        get: impl FnOnce(&'a HostColumn) -> Option<&'a [T]>,
    ) -> Result<&'a [T], ArenaError> {
        let col = self.read(key)?;
        let actual = col.layout();
        get(col).ok_or(ArenaError::LayoutMismatch {
            key,
            expected: ColumnLayout::of(key),
            actual,
        })
    }

    fn typed_mut<'a, T>(
        &'a mut self,
        key: BufferKey,
        get: impl FnOnce(&'a mut HostColumn) -> Option<&'a mut [T]>,
    ) -> Result<&'a mut [T], ArenaError> {
        let col = self.read_mut(key)?;
        let actual = col.layout();
        get(col).ok_or(ArenaError::LayoutMismatch {
            key,
            expected: ColumnLayout::of(key),
            actual,
        })
    }

    /// Positions (xyz) and masses (w).
    pub fn pos(&self) -> Result<&[[f32; 4]], ArenaError> {
        self.typed(BufferKey::Pos, HostColumn::as_float4)
    }

    /// Mutable positions.
    pub fn pos_mut(&mut self) -> Result<&mut [[f32; 4]], ArenaError> {
        self.typed_mut(BufferKey::Pos, HostColumn::as_float4_mut)
    }

    /// Velocities (xyz) and densities (w).
    pub fn vel(&self) -> Result<&[[f32; 4]], ArenaError> {
        self.typed(BufferKey::Vel, HostColumn::as_float4)
    }

    /// Mutable velocities.
    pub fn vel_mut(&mut self) -> Result<&mut [[f32; 4]], ArenaError> {
        self.typed_mut(BufferKey::Vel, HostColumn::as_float4_mut)
    }

    /// Particle info.
    pub fn info(&self) -> Result<&[ParticleInfo], ArenaError> {
        self.typed(BufferKey::Info, HostColumn::as_info)
    }

    /// Mutable particle info.
    pub fn info_mut(&mut self) -> Result<&mut [ParticleInfo], ArenaError> {
        self.typed_mut(BufferKey::Info, HostColumn::as_info_mut)
    }

    /// Particle hashes.
    pub fn hash(&self) -> Result<&[ParticleHash], ArenaError> {
        self.typed(BufferKey::Hash, HostColumn::as_hash)
    }

    /// Mutable particle hashes.
    pub fn hash_mut(&mut self) -> Result<&mut [ParticleHash], ArenaError> {
        self.typed_mut(BufferKey::Hash, HostColumn::as_hash_mut)
    }

    /// A scalar `f32` column.
    pub fn scalar(&self, key: BufferKey) -> Result<&[f32], ArenaError> {
        self.typed(key, HostColumn::as_float)
    }

    /// A mutable scalar `f32` column.
    pub fn scalar_mut(&mut self, key: BufferKey) -> Result<&mut [f32], ArenaError> {
        self.typed_mut(key, HostColumn::as_float_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::ParticleId;
    use proptest::prelude::*;

    fn tagged_list(n: usize) -> BufferList {
        let mut list = BufferList::new(n);
        list.register(BufferKey::Pos, Multiplicity::Double);
        list.register(BufferKey::Info, Multiplicity::Double);
        list.register(BufferKey::Tke, Multiplicity::Single);
        for (i, p) in list.pos_mut().unwrap().iter_mut().enumerate() {
            *p = [i as f32, 0.0, 0.0, 1.0];
        }
        for (i, info) in list.info_mut().unwrap().iter_mut().enumerate() {
            *info = ParticleInfo::fluid(ParticleId(i as u32));
        }
        for (i, k) in list.scalar_mut(BufferKey::Tke).unwrap().iter_mut().enumerate() {
            *k = i as f32 * 10.0;
        }
        list
    }

    #[test]
    fn register_is_idempotent() {
        let mut list = tagged_list(3);
        list.register(BufferKey::Pos, Multiplicity::Single);
        assert_eq!(
            list.slot(BufferKey::Pos).unwrap().multiplicity(),
            Multiplicity::Double
        );
        assert_eq!(list.pos().unwrap()[2][0], 2.0);
    }

    #[test]
    fn insert_rejects_wrong_length_and_layout() {
        let mut list = BufferList::new(2);
        let short = Slot::Single(HostColumn::zeroed(ColumnLayout::Float4, 1));
        assert!(matches!(
            list.insert(BufferKey::Pos, short),
            Err(ArenaError::LengthMismatch { .. })
        ));
        let wrong = Slot::Single(HostColumn::zeroed(ColumnLayout::Float, 2));
        assert!(matches!(
            list.insert(BufferKey::Pos, wrong),
            Err(ArenaError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn unknown_buffer_is_error() {
        let list = BufferList::new(1);
        assert_eq!(
            list.vel().unwrap_err(),
            ArenaError::UnknownBuffer {
                key: BufferKey::Vel
            }
        );
    }

    #[test]
    fn swap_roles_skips_absent_and_rejects_single() {
        let mut list = tagged_list(2);
        list.double_mut(BufferKey::Pos)
            .unwrap()
            .write_mut()
            .as_float4_mut()
            .unwrap()[0] = [9.0; 4];
        list.swap_roles(BufferKey::Pos | BufferKey::Vel).unwrap();
        assert_eq!(list.pos().unwrap()[0], [9.0; 4]);
        assert_eq!(
            list.swap_roles(BufferSet::single(BufferKey::Tke)),
            Err(ArenaError::NotDoubleBuffered {
                key: BufferKey::Tke
            })
        );
    }

    #[test]
    fn copy_range_between_lists() {
        let host = tagged_list(6);
        let mut device = BufferList::new(2);
        device.register(BufferKey::Pos, Multiplicity::Double);
        device.register(BufferKey::Info, Multiplicity::Double);
        device
            .copy_range_from(&host, host.key_set(), 3..5, 0)
            .unwrap();
        assert_eq!(device.info().unwrap()[0].id, ParticleId(3));
        assert_eq!(device.pos().unwrap()[1][0], 4.0);
        assert!(!device.contains(BufferKey::Tke));
    }

    #[test]
    fn resize_applies_to_every_column() {
        let mut list = tagged_list(2);
        list.resize(4);
        assert_eq!(list.len(), 4);
        assert_eq!(list.pos().unwrap().len(), 4);
        assert_eq!(list.scalar(BufferKey::Tke).unwrap().len(), 4);
    }

    proptest! {
        #[test]
        fn element_swaps_keep_columns_aligned(
            swaps in prop::collection::vec((0usize..16, 0usize..16), 0..64),
        ) {
            let mut list = tagged_list(16);
            for (i, j) in swaps {
                list.swap_elements(i, j);
            }
            let pos = list.pos().unwrap();
            let info = list.info().unwrap();
            let tke = list.scalar(BufferKey::Tke).unwrap();
            for k in 0..16 {
                let id = info[k].id.0 as f32;
                prop_assert_eq!(pos[k][0], id);
                prop_assert_eq!(tke[k], id * 10.0);
            }
        }
    }
}
