//! Node and device layout of a run.

use std::ops::Range;

use hydra_core::{DeviceIndex, GlobalDeviceId, NodeRank};
use smallvec::SmallVec;

use crate::error::PartitionError;

/// How many devices each node drives, and which node we are.
///
/// Bucket indices are dense and node-major: bucket `b` of device `d`
/// on node `r` is `offset(r) + d`, where `offset(r)` is the total
/// device count of nodes `0..r`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    rank: NodeRank,
    devices_per_node: SmallVec<[u8; 4]>,
    node_offsets: SmallVec<[usize; 4]>,
}

impl Topology {
    /// A single-node run with `devices` devices.
    pub fn single_node(devices: usize) -> Result<Self, PartitionError> {
        Self::new(NodeRank::COORDINATOR, &[devices])
    }

    /// A multi-node run. `devices_per_node[r]` is the device count of rank `r`.
    pub fn new(rank: NodeRank, devices_per_node: &[usize]) -> Result<Self, PartitionError> {
        if devices_per_node.is_empty() {
            return Err(PartitionError::InvalidTopology {
                reason: "no nodes".into(),
            });
        }
        if devices_per_node.len() > GlobalDeviceId::MAX_NODES {
            return Err(PartitionError::InvalidTopology {
                reason: format!(
                    "{} nodes exceed the maximum of {}",
                    devices_per_node.len(),
                    GlobalDeviceId::MAX_NODES
                ),
            });
        }
        if rank.as_usize() >= devices_per_node.len() {
            return Err(PartitionError::InvalidTopology {
                reason: format!("rank {rank} outside {} nodes", devices_per_node.len()),
            });
        }
        let mut counts = SmallVec::new();
        let mut offsets = SmallVec::new();
        let mut offset = 0;
        for (r, &n) in devices_per_node.iter().enumerate() {
            if n == 0 || n > GlobalDeviceId::MAX_DEVICES_PER_NODE {
                return Err(PartitionError::InvalidTopology {
                    reason: format!(
                        "node {r} has {n} devices, expected 1..={}",
                        GlobalDeviceId::MAX_DEVICES_PER_NODE
                    ),
                });
            }
            counts.push(n as u8);
            offsets.push(offset);
            offset += n;
        }
        Ok(Self {
            rank,
            devices_per_node: counts,
            node_offsets: offsets,
        })
    }

    /// This node's rank.
    pub fn rank(&self) -> NodeRank {
        self.rank
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.devices_per_node.len()
    }

    /// Whether more than one node participates.
    pub fn is_multi_node(&self) -> bool {
        self.node_count() > 1
    }

    /// Device count of `rank`.
    pub fn devices_on(&self, rank: NodeRank) -> usize {
        self.devices_per_node
            .get(rank.as_usize())
            .map_or(0, |&n| n as usize)
    }

    /// Device count of this node.
    pub fn local_devices(&self) -> usize {
        self.devices_on(self.rank)
    }

    /// Total devices across all nodes, i.e. the bucket count.
    pub fn total_devices(&self) -> usize {
        self.node_offsets.last().copied().unwrap_or(0)
            + self.devices_per_node.last().map_or(0, |&n| n as usize)
    }

    /// Bucket index of `device`, or `None` if the topology lacks it.
    pub fn bucket_of(&self, device: GlobalDeviceId) -> Option<usize> {
        let rank = device.rank().as_usize();
        let local = device.device().as_usize();
        let count = *self.devices_per_node.get(rank)? as usize;
        (local < count).then(|| self.node_offsets[rank] + local)
    }

    /// The device owning `bucket`.
    pub fn device_of_bucket(&self, bucket: usize) -> Option<GlobalDeviceId> {
        let rank = self.node_offsets.iter().rposition(|&off| off <= bucket)?;
        let local = bucket - self.node_offsets[rank];
        (local < self.devices_per_node[rank] as usize)
            .then(|| GlobalDeviceId::new(NodeRank(rank as u8), DeviceIndex(local as u8)))
    }

    /// Buckets of `rank`.
    pub fn buckets_of(&self, rank: NodeRank) -> Range<usize> {
        let start = self.node_offsets.get(rank.as_usize()).copied().unwrap_or(0);
        start..start + self.devices_on(rank)
    }

    /// Buckets of this node.
    pub fn local_buckets(&self) -> Range<usize> {
        self.buckets_of(self.rank)
    }

    /// Global id of local device `device`.
    pub fn global_id(&self, device: DeviceIndex) -> GlobalDeviceId {
        GlobalDeviceId::new(self.rank, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_node_major() {
        let topo = Topology::new(NodeRank(1), &[2, 3]).unwrap();
        assert_eq!(topo.total_devices(), 5);
        assert_eq!(topo.local_buckets(), 2..5);
        let gid = GlobalDeviceId::new(NodeRank(1), DeviceIndex(2));
        assert_eq!(topo.bucket_of(gid), Some(4));
        assert_eq!(topo.device_of_bucket(4), Some(gid));
        assert_eq!(
            topo.device_of_bucket(1),
            Some(GlobalDeviceId::new(NodeRank(0), DeviceIndex(1)))
        );
        assert_eq!(topo.device_of_bucket(5), None);
    }

    #[test]
    fn unknown_devices_have_no_bucket() {
        let topo = Topology::single_node(2).unwrap();
        assert_eq!(
            topo.bucket_of(GlobalDeviceId::new(NodeRank(0), DeviceIndex(2))),
            None
        );
        assert_eq!(
            topo.bucket_of(GlobalDeviceId::new(NodeRank(1), DeviceIndex(0))),
            None
        );
    }

    #[test]
    fn rejects_bad_layouts() {
        assert!(Topology::single_node(0).is_err());
        assert!(Topology::single_node(9).is_err());
        assert!(Topology::new(NodeRank(2), &[1, 1]).is_err());
        assert!(Topology::new(NodeRank(0), &[]).is_err());
        assert!(Topology::new(NodeRank(0), &[1; 33]).is_err());
    }
}
