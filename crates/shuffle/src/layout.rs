use dqs_storage::NodeResource;

/// Split `partition_count` partitions across `nodes` proportionally to their
/// core counts (largest-remainder apportionment).
///
/// Nodes reporting zero cores still get weight one. The result is a per-node
/// partition quota in the same order as `nodes`; quotas sum to
/// `partition_count`. Output depends only on the inputs.
pub fn apportion_partitions(nodes: &[NodeResource], partition_count: u32) -> Vec<u32> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let weights = nodes
        .iter()
        .map(|n| n.cores.max(1) as u64)
        .collect::<Vec<_>>();
    let total_weight: u64 = weights.iter().sum();
    let total = partition_count as u64;

    let mut quotas = Vec::with_capacity(nodes.len());
    let mut remainders = Vec::with_capacity(nodes.len());
    for (idx, w) in weights.iter().enumerate() {
        let exact = total * w;
        quotas.push((exact / total_weight) as u32);
        remainders.push((exact % total_weight, idx));
    }
    let assigned: u64 = quotas.iter().map(|q| *q as u64).sum();
    let mut leftover = total - assigned;

    // Largest remainder first; equal remainders go to the earlier node.
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders {
        if leftover == 0 {
            break;
        }
        quotas[idx] += 1;
        leftover -= 1;
    }
    quotas
}

#[cfg(test)]
mod tests {
    use super::apportion_partitions;
    use dqs_storage::NodeResource;

    #[test]
    fn quotas_follow_core_weights() {
        let nodes = vec![
            NodeResource::new("a", 6, 0),
            NodeResource::new("b", 2, 0),
        ];
        assert_eq!(apportion_partitions(&nodes, 8), vec![6, 2]);
        assert_eq!(apportion_partitions(&nodes, 6), vec![5, 1]);
    }

    #[test]
    fn fewer_partitions_than_nodes_leaves_some_nodes_idle() {
        let nodes = vec![
            NodeResource::new("a", 1, 0),
            NodeResource::new("b", 1, 0),
            NodeResource::new("c", 1, 0),
        ];
        let q = apportion_partitions(&nodes, 2);
        assert_eq!(q.iter().sum::<u32>(), 2);
        assert_eq!(q, vec![1, 1, 0]);
    }

    #[test]
    fn zero_core_nodes_still_participate() {
        let nodes = vec![NodeResource::new("a", 0, 0), NodeResource::new("b", 0, 0)];
        assert_eq!(apportion_partitions(&nodes, 4), vec![2, 2]);
    }
}
