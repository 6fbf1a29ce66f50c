use std::sync::RwLock;

use dqs_common::{DqsError, NodeAddress, Result};
use serde::{Deserialize, Serialize};

/// Capacity of one worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResource {
    pub address: NodeAddress,
    pub cores: u32,
    pub memory_bytes: u64,
}

impl NodeResource {
    pub fn new(address: impl Into<String>, cores: u32, memory_bytes: u64) -> Self {
        Self {
            address: NodeAddress::new(address),
            cores,
            memory_bytes,
        }
    }
}

/// Point-in-time view of the live worker nodes.
///
/// Nodes are kept sorted by address so every consumer iterates them in the
/// same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    nodes: Vec<NodeResource>,
}

impl ResourceSnapshot {
    pub fn new(mut nodes: Vec<NodeResource>) -> Self {
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        nodes.dedup_by(|a, b| a.address == b.address);
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeResource] {
        &self.nodes
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_cores(&self) -> u64 {
        self.nodes.iter().map(|n| n.cores as u64).sum()
    }

    /// Smallest per-node memory; broadcast tables must fit on every node.
    pub fn min_memory_bytes(&self) -> Option<u64> {
        self.nodes.iter().map(|n| n.memory_bytes).min()
    }

    /// `max(1, round(total_cores * ratio))`.
    pub fn partition_count(&self, partition_to_core_ratio: f64) -> u32 {
        let raw = (self.total_cores() as f64 * partition_to_core_ratio).round();
        if raw.is_finite() && raw >= 1.0 {
            raw.min(u32::MAX as f64) as u32
        } else {
            1
        }
    }

    pub fn require_live(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DqsError::Resource("no live worker nodes".to_string()));
        }
        Ok(())
    }
}

/// Source of worker-node capacity (`getResourceSnapshot`).
pub trait ResourceProvider: Send + Sync {
    fn snapshot(&self) -> Result<ResourceSnapshot>;
}

/// Fixed cluster description, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticResources {
    snapshot: RwLock<ResourceSnapshot>,
}

impl StaticResources {
    pub fn new(nodes: Vec<NodeResource>) -> Self {
        Self {
            snapshot: RwLock::new(ResourceSnapshot::new(nodes)),
        }
    }

    /// Load a JSON array of [`NodeResource`].
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let nodes: Vec<NodeResource> =
            serde_json::from_str(&s).map_err(|e| DqsError::InvalidConfig(e.to_string()))?;
        Ok(Self::new(nodes))
    }

    pub fn replace(&self, nodes: Vec<NodeResource>) {
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = ResourceSnapshot::new(nodes);
        }
    }
}

impl ResourceProvider for StaticResources {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .map_err(|_| DqsError::Resource("resource snapshot lock poisoned".to_string()))
    }
}
