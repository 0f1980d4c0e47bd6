//! Cell to device ownership map.

use hydra_core::{CellHash, GlobalDeviceId};
use tracing::debug;

use crate::error::PartitionError;
use crate::grid::Grid;
use crate::topology::Topology;

/// Owner of every grid cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMap {
    owners: Vec<GlobalDeviceId>,
}

impl DeviceMap {
    /// Every cell owned by `device`.
    pub fn uniform(grid: &Grid, device: GlobalDeviceId) -> Self {
        Self {
            owners: vec![device; grid.cell_count()],
        }
    }

    /// Owner computed per cell from its integer coordinates.
    pub fn from_fn(grid: &Grid, mut owner: impl FnMut([u32; 3]) -> GlobalDeviceId) -> Self {
        let owners = (0..grid.cell_count() as u32)
            .map(|i| owner(grid.coords(CellHash(i))))
            .collect();
        Self { owners }
    }

    /// Cut the domain along `axis` into one slab per device so that
    /// every device receives about the same number of particles.
    ///
    /// `histogram[s]` is the particle count of slice `s` along `axis`
    /// (see [`Grid::slice_histogram`]). Devices are filled in bucket
    /// order; a slab closes once its cumulative load reaches the
    /// device's share of the total. Every device keeps at least one
    /// slice when the axis is long enough.
    pub fn split_along(
        grid: &Grid,
        axis: usize,
        histogram: &[u64],
        topology: &Topology,
    ) -> Result<Self, PartitionError> {
        let slices = grid.dims()[axis] as usize;
        if histogram.len() != slices {
            return Err(PartitionError::HistogramMismatch {
                expected: slices,
                actual: histogram.len(),
            });
        }
        let devices = topology.total_devices();
        let total: u64 = histogram.iter().sum();

        let mut slice_owner = Vec::with_capacity(slices);
        let mut bucket = 0usize;
        let mut cumulative = 0u64;
        for (s, &count) in histogram.iter().enumerate() {
            slice_owner.push(bucket);
            cumulative += count;
            let share = total * (bucket as u64 + 1) / devices as u64;
            let remaining_slices = slices - s - 1;
            let remaining_devices = devices - bucket - 1;
            let load_full = total > 0 && cumulative >= share;
            let must_advance = remaining_slices <= remaining_devices;
            if bucket + 1 < devices && (load_full || must_advance) {
                bucket += 1;
            }
        }

        let mut owners_by_slice = Vec::with_capacity(slices);
        for &b in &slice_owner {
            let gid = topology
                .device_of_bucket(b)
                .ok_or_else(|| PartitionError::UnknownDevice {
                    device: format!("bucket {b}"),
                })?;
            owners_by_slice.push(gid);
        }
        debug!(axis, slices, devices, total, "split domain along axis");
        Ok(Self::from_fn(grid, |coords| owners_by_slice[coords[axis] as usize]))
    }

    /// Number of cells covered.
    pub fn cell_count(&self) -> usize {
        self.owners.len()
    }

    /// Owner of `cell`. The cell type tag is ignored.
    pub fn owner(&self, cell: CellHash) -> Result<GlobalDeviceId, PartitionError> {
        self.owners
            .get(cell.index() as usize)
            .copied()
            .ok_or(PartitionError::CellOutOfRange {
                cell: cell.index(),
                cells: self.owners.len(),
            })
    }

    /// Check every owner exists in `topology`.
    pub fn validate(&self, topology: &Topology) -> Result<(), PartitionError> {
        match self.owners.iter().find(|d| topology.bucket_of(**d).is_none()) {
            Some(bad) => Err(PartitionError::UnknownDevice {
                device: bad.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Cells owned by `device`.
    pub fn cells_of(&self, device: GlobalDeviceId) -> usize {
        self.owners.iter().filter(|&&d| d == device).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::{DeviceIndex, NodeRank};

    fn local(device: u8) -> GlobalDeviceId {
        GlobalDeviceId::new(NodeRank::COORDINATOR, DeviceIndex(device))
    }

    fn grid() -> Grid {
        Grid::new([0.0; 3], [1.0; 3], [8, 2, 1]).unwrap()
    }

    #[test]
    fn from_fn_uses_coordinates() {
        let g = grid();
        let map = DeviceMap::from_fn(&g, |[x, _, _]| local(u8::from(x >= 4)));
        assert_eq!(map.owner(g.linear([3, 1, 0])).unwrap(), local(0));
        assert_eq!(map.owner(g.linear([4, 0, 0])).unwrap(), local(1));
        assert_eq!(map.cells_of(local(1)), 8);
    }

    #[test]
    fn split_balances_uniform_load() {
        let g = grid();
        let topo = Topology::single_node(2).unwrap();
        let map = DeviceMap::split_along(&g, 0, &[10; 8], &topo).unwrap();
        assert_eq!(map.cells_of(local(0)), 8);
        assert_eq!(map.cells_of(local(1)), 8);
        assert_eq!(map.owner(g.linear([3, 0, 0])).unwrap(), local(0));
        assert_eq!(map.owner(g.linear([4, 0, 0])).unwrap(), local(1));
    }

    #[test]
    fn split_follows_skewed_load() {
        let g = grid();
        let topo = Topology::single_node(2).unwrap();
        let map = DeviceMap::split_along(&g, 0, &[100, 0, 0, 0, 0, 0, 0, 0], &topo).unwrap();
        assert_eq!(map.owner(g.linear([0, 0, 0])).unwrap(), local(0));
        assert_eq!(map.owner(g.linear([1, 0, 0])).unwrap(), local(1));
    }

    #[test]
    fn split_gives_every_device_a_slice() {
        let g = grid();
        let topo = Topology::new(NodeRank(0), &[2, 2]).unwrap();
        let map = DeviceMap::split_along(&g, 0, &[0, 0, 0, 0, 0, 0, 0, 50], &topo).unwrap();
        for b in 0..4 {
            let gid = topo.device_of_bucket(b).unwrap();
            assert!(map.cells_of(gid) > 0, "bucket {b} got no cells");
        }
        map.validate(&topo).unwrap();
    }

    #[test]
    fn split_rejects_wrong_histogram() {
        let g = grid();
        let topo = Topology::single_node(2).unwrap();
        assert!(matches!(
            DeviceMap::split_along(&g, 1, &[1, 2, 3], &topo),
            Err(PartitionError::HistogramMismatch { .. })
        ));
    }

    #[test]
    fn validate_flags_foreign_devices() {
        let g = grid();
        let topo = Topology::single_node(1).unwrap();
        let map = DeviceMap::uniform(&g, local(3));
        assert!(map.validate(&topo).is_err());
        assert!(map.owner(CellHash(99)).is_err());
    }
}
