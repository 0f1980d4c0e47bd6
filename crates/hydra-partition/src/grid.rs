//! Uniform cell grid over the simulation domain.

use hydra_arena::{BufferList, ParticleInfo};
use hydra_core::{CellHash, ParticleHash};

use crate::error::PartitionError;

/// Axis-aligned uniform grid.
///
/// Cells are linearized x-fastest: `index = (z * ny + y) * nx + x`.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    origin: [f64; 3],
    cell_size: [f64; 3],
    dims: [u32; 3],
}

impl Grid {
    /// Build a grid from its origin, cell edge lengths and cell counts.
    pub fn new(
        origin: [f64; 3],
        cell_size: [f64; 3],
        dims: [u32; 3],
    ) -> Result<Self, PartitionError> {
        if dims.contains(&0) {
            return Err(PartitionError::InvalidGrid {
                reason: format!("zero dimension in {dims:?}"),
            });
        }
        if cell_size.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(PartitionError::InvalidGrid {
                reason: format!("cell size {cell_size:?} must be finite and positive"),
            });
        }
        let cells = dims.iter().map(|&d| d as u64).product::<u64>();
        if cells > CellHash::MAX_CELLS as u64 {
            return Err(PartitionError::InvalidGrid {
                reason: format!("{cells} cells exceed the maximum of {}", CellHash::MAX_CELLS),
            });
        }
        Ok(Self {
            origin,
            cell_size,
            dims,
        })
    }

    /// Cells per axis.
    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    /// Total number of cells.
    pub fn cell_count(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// The axis with the most cells. Ties resolve to the lower axis.
    pub fn longest_axis(&self) -> usize {
        let mut best = 0;
        for axis in 1..3 {
            if self.dims[axis] > self.dims[best] {
                best = axis;
            }
        }
        best
    }

    /// Linear hash of integer cell coordinates.
    pub fn linear(&self, coords: [u32; 3]) -> CellHash {
        let [nx, ny, _] = self.dims;
        CellHash((coords[2] * ny + coords[1]) * nx + coords[0])
    }

    /// Integer coordinates of a cell.
    pub fn coords(&self, cell: CellHash) -> [u32; 3] {
        let [nx, ny, _] = self.dims;
        let i = cell.index();
        [i % nx, (i / nx) % ny, i / (nx * ny)]
    }

    /// The cell containing `pos`. Positions outside the domain clamp to
    /// the nearest border cell.
    pub fn cell_of(&self, pos: [f32; 4]) -> CellHash {
        let mut coords = [0u32; 3];
        for axis in 0..3 {
            let rel = (pos[axis] as f64 - self.origin[axis]) / self.cell_size[axis];
            let max = (self.dims[axis] - 1) as f64;
            coords[axis] = rel.floor().clamp(0.0, max) as u32;
        }
        self.linear(coords)
    }

    /// Recompute the `Hash` column from `Pos` and `Info`.
    pub fn hash_particles(&self, list: &mut BufferList) -> Result<(), PartitionError> {
        let hashes: Vec<ParticleHash> = list
            .pos()?
            .iter()
            .zip(list.info()?)
            .map(|(pos, info)| ParticleHash::new(self.cell_of(*pos), info.id))
            .collect();
        list.hash_mut()?.copy_from_slice(&hashes);
        Ok(())
    }

    /// Counts of the particles selected by `include`, per slice of
    /// cells along `axis`.
    pub fn slice_histogram(
        &self,
        list: &BufferList,
        axis: usize,
        include: impl Fn(&ParticleInfo) -> bool,
    ) -> Result<Vec<u64>, PartitionError> {
        let mut histogram = vec![0u64; self.dims[axis] as usize];
        for (hash, info) in list.hash()?.iter().zip(list.info()?) {
            if !include(info) {
                continue;
            }
            let coords = self.coords(hash.cell_hash());
            if let Some(bin) = histogram.get_mut(coords[axis] as usize) {
                *bin += 1;
            }
        }
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_arena::{Multiplicity, ParticleKind};
    use hydra_core::{BufferKey, ParticleId};

    fn grid() -> Grid {
        Grid::new([0.0; 3], [0.5; 3], [4, 2, 3]).unwrap()
    }

    #[test]
    fn linear_and_coords_roundtrip() {
        let g = grid();
        for z in 0..3 {
            for y in 0..2 {
                for x in 0..4 {
                    assert_eq!(g.coords(g.linear([x, y, z])), [x, y, z]);
                }
            }
        }
        assert_eq!(g.cell_count(), 24);
        assert_eq!(g.longest_axis(), 0);
    }

    #[test]
    fn cell_of_clamps_outside_points() {
        let g = grid();
        assert_eq!(g.coords(g.cell_of([-3.0, 0.6, 100.0, 1.0])), [0, 1, 2]);
        assert_eq!(g.coords(g.cell_of([1.99, 0.1, 0.0, 1.0])), [3, 0, 0]);
    }

    #[test]
    fn rejects_degenerate_grids() {
        assert!(Grid::new([0.0; 3], [1.0; 3], [0, 1, 1]).is_err());
        assert!(Grid::new([0.0; 3], [0.0, 1.0, 1.0], [1, 1, 1]).is_err());
        assert!(Grid::new([0.0; 3], [1.0; 3], [1 << 11, 1 << 11, 1 << 11]).is_err());
    }

    #[test]
    fn hash_and_histogram() {
        let g = grid();
        let mut list = BufferList::new(3);
        list.register(BufferKey::Pos, Multiplicity::Single);
        list.register(BufferKey::Info, Multiplicity::Single);
        list.register(BufferKey::Hash, Multiplicity::Single);
        list.pos_mut()
            .unwrap()
            .copy_from_slice(&[[0.1, 0.0, 0.0, 1.0], [1.6, 0.0, 0.0, 1.0], [1.7, 0.9, 0.0, 1.0]]);
        for (i, info) in list.info_mut().unwrap().iter_mut().enumerate() {
            *info = ParticleInfo::fluid(ParticleId(i as u32 + 100));
        }
        g.hash_particles(&mut list).unwrap();
        let hashes = list.hash().unwrap();
        assert_eq!(g.coords(hashes[1].cell_hash()), [3, 0, 0]);
        assert_eq!(hashes[2].0 & 0xffff_ffff, 102);
        assert_eq!(g.slice_histogram(&list, 0, |_| true).unwrap(), vec![1, 0, 0, 2]);
        list.info_mut().unwrap()[0].kind = ParticleKind::Boundary;
        let fluid_only = g
            .slice_histogram(&list, 0, |info| info.kind == ParticleKind::Fluid)
            .unwrap();
        assert_eq!(fluid_only, vec![0, 0, 0, 2]);
    }
}
