//! In-place bucket sort of host particle data by owning device.
//!
//! The key space is small (one bucket per device in the run) and the
//! records are wide (every registered column), so the sort is a
//! counting pass followed by an in-place compaction: each misplaced
//! particle is swapped with a particle of the bucket being filled,
//! found by a cursor scanning backwards from the end of the array.
//! Each particle moves at most twice.
//!
//! A verification pass always runs afterwards. It checks bucket
//! monotonicity, recounts buckets, and confirms the key array still
//! agrees with the `Hash` column, i.e. that every column moved under
//! the same permutation.

use std::ops::Range;

use hydra_arena::BufferList;
use hydra_core::{DeviceIndex, ParticleHash};
use tracing::{debug, trace};

use crate::error::PartitionError;
use crate::map::DeviceMap;
use crate::topology::Topology;

/// Layout produced by [`partition`].
///
/// All offsets are absolute indices into the host array, which is
/// ordered node-major.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionReport {
    /// Number of record swaps performed.
    pub swaps: usize,
    /// Particles per bucket, for every device of every node.
    pub bucket_counts: Vec<usize>,
    /// First index of every bucket.
    pub bucket_starts: Vec<usize>,
    /// Particles per node.
    pub node_counts: Vec<usize>,
}

impl PartitionReport {
    /// Index range of `bucket`.
    pub fn bucket_range(&self, bucket: usize) -> Range<usize> {
        let start = self.bucket_starts[bucket];
        start..start + self.bucket_counts[bucket]
    }

    /// Index ranges of this node's devices, in device order.
    pub fn local_ranges(&self, topology: &Topology) -> Vec<Range<usize>> {
        topology
            .local_buckets()
            .map(|b| self.bucket_range(b))
            .collect()
    }

    /// Index range of a local device.
    pub fn device_range(&self, topology: &Topology, device: DeviceIndex) -> Option<Range<usize>> {
        topology
            .bucket_of(topology.global_id(device))
            .map(|b| self.bucket_range(b))
    }

    /// Index range of the whole local node.
    pub fn node_range(&self, topology: &Topology) -> Range<usize> {
        let buckets = topology.local_buckets();
        let start = self.bucket_starts.get(buckets.start).copied().unwrap_or(0);
        start..start + self.node_counts[topology.rank().as_usize()]
    }
}

fn bucket_keys(
    hashes: &[ParticleHash],
    map: &DeviceMap,
    topology: &Topology,
) -> Result<Vec<u16>, PartitionError> {
    hashes
        .iter()
        .map(|h| {
            let owner = map.owner(h.cell_hash())?;
            topology
                .bucket_of(owner)
                .map(|b| b as u16)
                .ok_or_else(|| PartitionError::UnknownDevice {
                    device: owner.to_string(),
                })
        })
        .collect()
}

/// Reorder every column of `list` so that each device's particles are
/// contiguous and devices appear in bucket order.
///
/// Bucket keys are derived from the READ side of the `Hash` column,
/// which the caller must have filled for every particle. Fails with
/// [`PartitionError::InconsistentBuckets`] or
/// [`PartitionError::VerificationFailed`] if the internal invariants
/// break; both are fatal.
pub fn partition(
    list: &mut BufferList,
    map: &DeviceMap,
    topology: &Topology,
) -> Result<PartitionReport, PartitionError> {
    let n = list.len();
    let buckets = topology.total_devices();
    let mut keys = bucket_keys(list.hash()?, map, topology)?;

    // Count.
    let mut bucket_counts = vec![0usize; buckets];
    for &k in &keys {
        bucket_counts[k as usize] += 1;
    }
    let mut node_counts = vec![0usize; topology.node_count()];
    for (b, &count) in bucket_counts.iter().enumerate() {
        if let Some(owner) = topology.device_of_bucket(b) {
            node_counts[owner.rank().as_usize()] += count;
        }
    }

    // Prefix sums.
    let mut bucket_starts = Vec::with_capacity(buckets);
    let mut acc = 0;
    for &count in &bucket_counts {
        bucket_starts.push(acc);
        acc += count;
    }

    // Compaction. The last bucket falls into place once the others are done.
    let mut swaps = 0;
    for bucket in 0..buckets.saturating_sub(1) {
        let key = bucket as u16;
        let end = bucket_starts[bucket] + bucket_counts[bucket];
        let mut left = bucket_starts[bucket];
        let mut right = n;
        while left < end {
            if keys[left] == key {
                left += 1;
                continue;
            }
            loop {
                if right <= end {
                    return Err(PartitionError::InconsistentBuckets { bucket, slot: left });
                }
                right -= 1;
                if keys[right] == key {
                    break;
                }
            }
            keys.swap(left, right);
            list.swap_elements(left, right);
            swaps += 1;
            left += 1;
        }
        trace!(bucket, count = bucket_counts[bucket], "bucket placed");
    }

    verify(list, &keys, &bucket_counts, map, topology)?;

    debug!(particles = n, buckets, swaps, "partitioned host particles");
    Ok(PartitionReport {
        swaps,
        bucket_counts,
        bucket_starts,
        node_counts,
    })
}

fn verify(
    list: &BufferList,
    keys: &[u16],
    expected_counts: &[usize],
    map: &DeviceMap,
    topology: &Topology,
) -> Result<(), PartitionError> {
    if let Some(i) = keys.windows(2).position(|w| w[0] > w[1]) {
        return Err(PartitionError::VerificationFailed {
            reason: format!(
                "bucket order broken at index {}: {} before {}",
                i + 1,
                keys[i],
                keys[i + 1]
            ),
        });
    }

    let mut counts = vec![0usize; expected_counts.len()];
    for &k in keys {
        counts[k as usize] += 1;
    }
    if counts != expected_counts {
        return Err(PartitionError::VerificationFailed {
            reason: format!("bucket counts {counts:?} differ from {expected_counts:?}"),
        });
    }

    let moved = bucket_keys(list.hash()?, map, topology)?;
    if let Some(i) = moved.iter().zip(keys).position(|(a, b)| a != b) {
        return Err(PartitionError::VerificationFailed {
            reason: format!("hash column and key array disagree at index {i}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use hydra_arena::{Multiplicity, ParticleInfo};
    use hydra_core::{BufferKey, CellHash, GlobalDeviceId, NodeRank, ParticleId};
    use proptest::prelude::*;

    /// A 1-D row of `cells` cells with particles placed by cell index.
    fn fixture(cells_of_particles: &[u32], cells: u32) -> (BufferList, Grid) {
        let grid = Grid::new([0.0; 3], [1.0; 3], [cells, 1, 1]).unwrap();
        let n = cells_of_particles.len();
        let mut list = BufferList::new(n);
        list.register(BufferKey::Pos, Multiplicity::Double);
        list.register(BufferKey::Vel, Multiplicity::Double);
        list.register(BufferKey::Info, Multiplicity::Single);
        list.register(BufferKey::Hash, Multiplicity::Single);
        list.register(BufferKey::Tke, Multiplicity::Single);
        for (i, &c) in cells_of_particles.iter().enumerate() {
            list.pos_mut().unwrap()[i] = [c as f32 + 0.5, 0.0, 0.0, 1.0];
            list.vel_mut().unwrap()[i] = [i as f32, 0.0, 0.0, 1000.0];
            list.info_mut().unwrap()[i] = ParticleInfo::fluid(ParticleId(i as u32));
            list.scalar_mut(BufferKey::Tke).unwrap()[i] = i as f32;
            list.hash_mut().unwrap()[i] = ParticleHash::new(CellHash(c), ParticleId(i as u32));
        }
        (list, grid)
    }

    fn modulo_map(grid: &Grid, topology: &Topology) -> DeviceMap {
        let total = topology.total_devices() as u32;
        DeviceMap::from_fn(grid, |[x, _, _]| {
            topology
                .device_of_bucket((x % total) as usize)
                .unwrap_or(GlobalDeviceId(0))
        })
    }

    fn buckets_of(list: &BufferList, map: &DeviceMap, topology: &Topology) -> Vec<u16> {
        bucket_keys(list.hash().unwrap(), map, topology).unwrap()
    }

    #[test]
    fn empty_list_partitions_trivially() {
        let (mut list, grid) = fixture(&[], 4);
        let topo = Topology::single_node(2).unwrap();
        let map = modulo_map(&grid, &topo);
        let report = partition(&mut list, &map, &topo).unwrap();
        assert_eq!(report.swaps, 0);
        assert_eq!(report.bucket_counts, vec![0, 0]);
        assert_eq!(report.local_ranges(&topo), vec![0..0, 0..0]);
    }

    #[test]
    fn single_bucket_is_a_noop() {
        let (mut list, grid) = fixture(&[3, 1, 2, 0, 1], 4);
        let before = list.clone();
        let topo = Topology::single_node(1).unwrap();
        let map = modulo_map(&grid, &topo);
        let report = partition(&mut list, &map, &topo).unwrap();
        assert_eq!(report.swaps, 0);
        assert_eq!(list, before);
        assert_eq!(report.bucket_range(0), 0..5);
    }

    #[test]
    fn empty_middle_bucket_is_skipped() {
        let (mut list, grid) = fixture(&[2, 0, 2, 0, 2], 3);
        let topo = Topology::single_node(3).unwrap();
        let map = modulo_map(&grid, &topo);
        let report = partition(&mut list, &map, &topo).unwrap();
        assert_eq!(report.bucket_counts, vec![2, 0, 3]);
        assert_eq!(report.bucket_starts, vec![0, 2, 2]);
        assert_eq!(buckets_of(&list, &map, &topo), vec![0, 0, 2, 2, 2]);
    }

    #[test]
    fn multi_node_offsets_fold_prior_nodes() {
        let (mut list, grid) = fixture(&[3, 2, 1, 0, 3, 2, 1, 0, 2], 4);
        let topo = Topology::new(NodeRank(1), &[2, 2]).unwrap();
        let map = modulo_map(&grid, &topo);
        let report = partition(&mut list, &map, &topo).unwrap();
        assert_eq!(report.node_counts, vec![4, 5]);
        assert_eq!(report.local_ranges(&topo), vec![4..7, 7..9]);
        assert_eq!(report.node_range(&topo), 4..9);
        assert_eq!(report.device_range(&topo, DeviceIndex(1)), Some(7..9));
    }

    #[test]
    fn unmapped_cell_is_rejected() {
        let (mut list, _) = fixture(&[0, 9], 10);
        let small = Grid::new([0.0; 3], [1.0; 3], [4, 1, 1]).unwrap();
        let topo = Topology::single_node(2).unwrap();
        let map = modulo_map(&small, &topo);
        assert!(matches!(
            partition(&mut list, &map, &topo),
            Err(PartitionError::CellOutOfRange { cell: 9, .. })
        ));
    }

    fn arb_case() -> impl Strategy<Value = (Vec<u32>, usize, u32)> {
        (1usize..=6, 1u32..=12).prop_flat_map(|(devices, cells)| {
            (
                prop::collection::vec(0..cells, 0..200),
                Just(devices),
                Just(cells),
            )
        })
    }

    proptest! {
        #[test]
        fn buckets_are_monotonic_and_counts_match(case in arb_case()) {
            let (cells, devices, ncells) = case;
            let (mut list, grid) = fixture(&cells, ncells);
            let topo = Topology::single_node(devices).unwrap();
            let map = modulo_map(&grid, &topo);

            let mut expected = vec![0usize; devices];
            for &c in &cells {
                expected[(c as usize) % devices] += 1;
            }

            let report = partition(&mut list, &map, &topo).unwrap();
            let keys = buckets_of(&list, &map, &topo);
            prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(&report.bucket_counts, &expected);
            prop_assert_eq!(report.bucket_counts.iter().sum::<usize>(), cells.len());
            for b in 0..devices {
                for i in report.bucket_range(b) {
                    prop_assert_eq!(keys[i] as usize, b);
                }
            }
        }

        #[test]
        fn every_column_follows_the_same_permutation(case in arb_case()) {
            let (cells, devices, ncells) = case;
            let (mut list, grid) = fixture(&cells, ncells);
            let topo = Topology::single_node(devices).unwrap();
            let map = modulo_map(&grid, &topo);
            partition(&mut list, &map, &topo).unwrap();

            let info = list.info().unwrap();
            let vel = list.vel().unwrap();
            let pos = list.pos().unwrap();
            let tke = list.scalar(BufferKey::Tke).unwrap();
            let hash = list.hash().unwrap();
            let mut seen = vec![false; cells.len()];
            for k in 0..cells.len() {
                let origin = info[k].id.0 as usize;
                prop_assert!(!seen[origin]);
                seen[origin] = true;
                prop_assert_eq!(vel[k][0], origin as f32);
                prop_assert_eq!(tke[k], origin as f32);
                prop_assert_eq!(pos[k][0], cells[origin] as f32 + 0.5);
                prop_assert_eq!(hash[k].cell_hash(), CellHash(cells[origin]));
            }
        }

        #[test]
        fn partitioning_twice_is_idempotent(case in arb_case()) {
            let (cells, devices, ncells) = case;
            let (mut list, grid) = fixture(&cells, ncells);
            let topo = Topology::single_node(devices).unwrap();
            let map = modulo_map(&grid, &topo);
            let first = partition(&mut list, &map, &topo).unwrap();
            let snapshot = list.clone();
            let second = partition(&mut list, &map, &topo).unwrap();
            prop_assert_eq!(second.swaps, 0);
            prop_assert_eq!(&list, &snapshot);
            prop_assert_eq!(first.bucket_counts, second.bucket_counts);
        }
    }
}
