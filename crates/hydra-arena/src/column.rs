//! Column storage and the element-swap primitive.

use std::ops::Range;

use hydra_core::{BufferKey, ParticleHash, ParticleId};

use crate::error::ArenaError;

/// One per-particle array that supports in-place reordering.
///
/// [`swap_elements`](Column::swap_elements) is the only reordering
/// primitive in the crate. Everything that permutes particles goes
/// through it so that all columns move together.
pub trait Column {
    /// Number of elements.
    fn len(&self) -> usize;

    /// Whether the column holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exchange elements `i` and `j`.
    fn swap_elements(&mut self, i: usize, j: usize);

    /// Grow with default values or truncate to `len` elements.
    fn resize(&mut self, len: usize);
}

impl<T: Copy + Default> Column for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn swap_elements(&mut self, i: usize, j: usize) {
        self.swap(i, j);
    }

    fn resize(&mut self, len: usize) {
        Vec::resize(self, len, T::default());
    }
}

/// Broad particle category stored in [`ParticleInfo`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ParticleKind {
    /// Fluid particle.
    #[default]
    Fluid,
    /// Boundary particle or segment.
    Boundary,
    /// Boundary vertex.
    Vertex,
    /// Probe that samples the flow without interacting.
    Testpoint,
}

/// The `Info` column element: type, flags, body and identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParticleInfo {
    /// Particle category.
    pub kind: ParticleKind,
    /// Model-specific flag bits.
    pub flags: u16,
    /// Index of the moving body this particle belongs to, if any.
    pub object: Option<u16>,
    /// Stable identity.
    pub id: ParticleId,
}

impl ParticleInfo {
    /// Flag bit marking a particle that left the domain and awaits compaction.
    pub const FLAG_DELETED: u16 = 1 << 15;

    /// A fluid particle with the given identity.
    pub fn fluid(id: ParticleId) -> Self {
        Self {
            kind: ParticleKind::Fluid,
            flags: 0,
            object: None,
            id,
        }
    }

    /// Whether the particle is marked for deletion.
    pub fn is_deleted(&self) -> bool {
        self.flags & Self::FLAG_DELETED != 0
    }
}

impl Default for ParticleInfo {
    fn default() -> Self {
        Self::fluid(ParticleId(0))
    }
}

/// Element type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnLayout {
    /// Four `f32` per particle.
    Float4,
    /// Four `f64` per particle.
    Double4,
    /// One `f32` per particle.
    Float,
    /// Symmetric 3x3 tensor, six `f32` per particle.
    Tensor,
    /// [`ParticleInfo`] per particle.
    Info,
    /// [`ParticleHash`] per particle.
    Hash,
    /// Four `u32` indices per particle.
    Index4,
    /// One `u32` per particle.
    Index,
}

impl ColumnLayout {
    /// The layout used for a given buffer.
    pub fn of(key: BufferKey) -> Self {
        match key {
            BufferKey::Pos
            | BufferKey::Vel
            | BufferKey::Forces
            | BufferKey::Volume
            | BufferKey::EulerVel
            | BufferKey::GradGamma
            | BufferKey::BoundElements
            | BufferKey::VertPos
            | BufferKey::Normals
            | BufferKey::Vorticity => Self::Float4,
            BufferKey::PosGlobal => Self::Double4,
            BufferKey::Sigma
            | BufferKey::Tke
            | BufferKey::Epsilon
            | BufferKey::TurbVisc
            | BufferKey::SpsTurbVisc
            | BufferKey::InternalEnergy => Self::Float,
            BufferKey::Tau => Self::Tensor,
            BufferKey::Info => Self::Info,
            BufferKey::Hash => Self::Hash,
            BufferKey::Vertices => Self::Index4,
            BufferKey::NeibsList => Self::Index,
        }
    }
}

/// A typed, host-resident column.
#[derive(Clone, Debug, PartialEq)]
pub enum HostColumn {
    /// See [`ColumnLayout::Float4`].
    Float4(Vec<[f32; 4]>),
    /// See [`ColumnLayout::Double4`].
    Double4(Vec<[f64; 4]>),
    /// See [`ColumnLayout::Float`].
    Float(Vec<f32>),
    /// See [`ColumnLayout::Tensor`].
    Tensor(Vec<[f32; 6]>),
    /// See [`ColumnLayout::Info`].
    Info(Vec<ParticleInfo>),
    /// See [`ColumnLayout::Hash`].
    Hash(Vec<ParticleHash>),
    /// See [`ColumnLayout::Index4`].
    Index4(Vec<[u32; 4]>),
    /// See [`ColumnLayout::Index`].
    Index(Vec<u32>),
}

macro_rules! each_column {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            HostColumn::Float4($v) => $body,
            HostColumn::Double4($v) => $body,
            HostColumn::Float($v) => $body,
            HostColumn::Tensor($v) => $body,
            HostColumn::Info($v) => $body,
            HostColumn::Hash($v) => $body,
            HostColumn::Index4($v) => $body,
            HostColumn::Index($v) => $body,
        }
    };
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $elem:ty) => {
        #[doc = concat!("The elements, if this is a `", stringify!($variant), "` column.")]
        pub fn $get(&self) -> Option<&[$elem]> {
            match self {
                HostColumn::$variant(v) => Some(v),
                _ => None,
            }
        }

        #[doc = concat!("Mutable elements, if this is a `", stringify!($variant), "` column.")]
        pub fn $get_mut(&mut self) -> Option<&mut [$elem]> {
            match self {
                HostColumn::$variant(v) => Some(v),
                _ => None,
            }
        }
    };
}

impl HostColumn {
    /// A column of `len` default elements.
    pub fn zeroed(layout: ColumnLayout, len: usize) -> Self {
        match layout {
            ColumnLayout::Float4 => Self::Float4(vec![[0.0; 4]; len]),
            ColumnLayout::Double4 => Self::Double4(vec![[0.0; 4]; len]),
            ColumnLayout::Float => Self::Float(vec![0.0; len]),
            ColumnLayout::Tensor => Self::Tensor(vec![[0.0; 6]; len]),
            ColumnLayout::Info => Self::Info(vec![ParticleInfo::default(); len]),
            ColumnLayout::Hash => Self::Hash(vec![ParticleHash::default(); len]),
            ColumnLayout::Index4 => Self::Index4(vec![[0; 4]; len]),
            ColumnLayout::Index => Self::Index(vec![0; len]),
        }
    }

    /// The element layout.
    pub fn layout(&self) -> ColumnLayout {
        match self {
            Self::Float4(_) => ColumnLayout::Float4,
            Self::Double4(_) => ColumnLayout::Double4,
            Self::Float(_) => ColumnLayout::Float,
            Self::Tensor(_) => ColumnLayout::Tensor,
            Self::Info(_) => ColumnLayout::Info,
            Self::Hash(_) => ColumnLayout::Hash,
            Self::Index4(_) => ColumnLayout::Index4,
            Self::Index(_) => ColumnLayout::Index,
        }
    }

    typed_access!(as_float4, as_float4_mut, Float4, [f32; 4]);
    typed_access!(as_double4, as_double4_mut, Double4, [f64; 4]);
    typed_access!(as_float, as_float_mut, Float, f32);
    typed_access!(as_tensor, as_tensor_mut, Tensor, [f32; 6]);
    typed_access!(as_info, as_info_mut, Info, ParticleInfo);
    typed_access!(as_hash, as_hash_mut, Hash, ParticleHash);
    typed_access!(as_index4, as_index4_mut, Index4, [u32; 4]);
    typed_access!(as_index, as_index_mut, Index, u32);

    /// Copy `src[range]` into `self[dst_start..]`.
    ///
    /// Both columns must share a layout and both ranges must be in bounds.
    /// `key` is only used to label errors.
    pub fn copy_range_from(
        &mut self,
        key: BufferKey,
        src: &HostColumn,
        range: Range<usize>,
        dst_start: usize,
    ) -> Result<(), ArenaError> {
        let count = range.len();
        if range.end > src.len() {
            return Err(ArenaError::OutOfBounds {
                key,
                index: range.end,
                len: src.len(),
            });
        }
        if dst_start + count > self.len() {
            return Err(ArenaError::OutOfBounds {
                key,
                index: dst_start + count,
                len: self.len(),
            });
        }
        let dst = dst_start..dst_start + count;
        match (self, src) {
            (Self::Float4(d), Self::Float4(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Double4(d), Self::Double4(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Float(d), Self::Float(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Tensor(d), Self::Tensor(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Info(d), Self::Info(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Hash(d), Self::Hash(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Index4(d), Self::Index4(s)) => d[dst].copy_from_slice(&s[range]),
            (Self::Index(d), Self::Index(s)) => d[dst].copy_from_slice(&s[range]),
            (d, s) => {
                return Err(ArenaError::LayoutMismatch {
                    key,
                    expected: d.layout(),
                    actual: s.layout(),
                })
            }
        }
        Ok(())
    }
}

impl Column for HostColumn {
    fn len(&self) -> usize {
        each_column!(self, v => v.len())
    }

    fn swap_elements(&mut self, i: usize, j: usize) {
        each_column!(self, v => v.swap(i, j))
    }

    fn resize(&mut self, len: usize) {
        each_column!(self, v => Column::resize(v, len))
    }
}
