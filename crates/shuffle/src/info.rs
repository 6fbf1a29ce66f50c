use std::collections::BTreeSet;

use dqs_common::{DqsError, NodeAddress, Result, SetIdentifier};
use dqs_storage::ResourceSnapshot;
use serde::{Deserialize, Serialize};

use crate::layout::apportion_partitions;

/// Assignment of the output partitions of one redistributing stage to worker
/// nodes. Every worker participating in the stage receives the same mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleInfo {
    /// Set whose rows are redistributed.
    pub set: SetIdentifier,
    /// `assignments[p]` owns partition `p`.
    pub assignments: Vec<NodeAddress>,
}

impl ShuffleInfo {
    /// Map `[0, partition_count)` onto the live nodes of `snapshot`.
    ///
    /// Nodes receive contiguous partition ranges sized by their core share,
    /// in address order, so repeated calls with the same snapshot return the
    /// same mapping. When there are fewer nodes than partitions several
    /// partitions land on one node.
    ///
    /// # Errors
    /// [`DqsError::Resource`] when the snapshot has no live node.
    pub fn compute_mapping(
        set: &SetIdentifier,
        partition_count: u32,
        snapshot: &ResourceSnapshot,
    ) -> Result<Self> {
        if snapshot.is_empty() {
            return Err(DqsError::Resource(format!(
                "no live workers to host {partition_count} partitions of {set}"
            )));
        }
        let partition_count = partition_count.max(1);
        let quotas = apportion_partitions(snapshot.nodes(), partition_count);
        let mut assignments = Vec::with_capacity(partition_count as usize);
        for (node, quota) in snapshot.nodes().iter().zip(quotas) {
            for _ in 0..quota {
                assignments.push(node.address.clone());
            }
        }
        Ok(Self {
            set: set.clone(),
            assignments,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.assignments.len() as u32
    }

    pub fn node_for(&self, partition: u32) -> Option<&NodeAddress> {
        self.assignments.get(partition as usize)
    }

    pub fn partitions_for(&self, node: &NodeAddress) -> Vec<u32> {
        self.assignments
            .iter()
            .enumerate()
            .filter(|(_, n)| *n == node)
            .map(|(p, _)| p as u32)
            .collect()
    }

    /// Distinct nodes owning at least one partition, in address order.
    pub fn participants(&self) -> Vec<NodeAddress> {
        self.assignments
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqs_storage::NodeResource;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot::new(vec![
            NodeResource::new("w2:8108", 2, 1 << 30),
            NodeResource::new("w1:8108", 2, 1 << 30),
        ])
    }

    #[test]
    fn mapping_is_deterministic() {
        let set = SetIdentifier::scoped("d", "agg", 1);
        let a = ShuffleInfo::compute_mapping(&set, 6, &snapshot()).expect("map");
        let b = ShuffleInfo::compute_mapping(&set, 6, &snapshot()).expect("map");
        assert_eq!(a, b);
    }

    #[test]
    fn every_partition_maps_to_a_live_node() {
        let set = SetIdentifier::scoped("d", "agg", 1);
        let snap = snapshot();
        let live = snap.addresses();
        let info = ShuffleInfo::compute_mapping(&set, 5, &snap).expect("map");
        assert_eq!(info.partition_count(), 5);
        for p in 0..5 {
            assert!(live.contains(info.node_for(p).expect("owner")));
        }
        assert!(info.node_for(5).is_none());
        assert_eq!(info.partitions_for(&NodeAddress::new("w1:8108")), vec![0, 1, 2]);
        assert_eq!(info.partitions_for(&NodeAddress::new("w2:8108")), vec![3, 4]);
    }

    #[test]
    fn single_partition_has_single_participant() {
        let set = SetIdentifier::scoped("d", "agg", 1);
        let info = ShuffleInfo::compute_mapping(&set, 1, &snapshot()).expect("map");
        assert_eq!(info.participants(), vec![NodeAddress::new("w1:8108")]);
    }

    #[test]
    fn empty_cluster_is_a_resource_error() {
        let set = SetIdentifier::scoped("d", "agg", 1);
        let err = ShuffleInfo::compute_mapping(&set, 4, &ResourceSnapshot::default())
            .expect_err("no nodes");
        assert_eq!(err.kind(), "resource");
    }
}
