//! Cluster topology: the ordered node list and its shard layout

use crate::error::{DistributedError, Result};
use query_core::{ClusterConfig, LayerConfig, NodeInfo};
use std::collections::BTreeMap;

/// Immutable view of the cluster, loaded once from configuration
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    config: ClusterConfig,
    nodes: Vec<NodeInfo>,
    /// shard id -> node indexes, ordered by replica
    shards: BTreeMap<u32, Vec<usize>>,
}

impl ClusterTopology {
    /// Build a topology from a validated layer configuration
    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.cluster.clone(), config.nodes.clone()))
    }

    pub(crate) fn new(config: ClusterConfig, nodes: Vec<NodeInfo>) -> Self {
        let mut shards: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            shards.entry(node.shard).or_default().push(idx);
        }
        for members in shards.values_mut() {
            members.sort_by_key(|&idx| nodes[idx].replica);
        }
        Self {
            config,
            nodes,
            shards,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// All nodes in configuration order
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> Option<&NodeInfo> {
        self.nodes.get(idx)
    }

    /// Shard ids in ascending order
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.keys().copied().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Node indexes holding a replica of `shard`
    pub fn replicas_of(&self, shard: u32) -> &[usize] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Preferred replica of a shard: highest weight, then lowest replica number
    pub fn preferred_replica(&self, shard: u32) -> Result<usize> {
        self.replicas_of(shard)
            .iter()
            .copied()
            .max_by(|&a, &b| {
                let (na, nb) = (&self.nodes[a], &self.nodes[b]);
                na.weight
                    .cmp(&nb.weight)
                    .then_with(|| nb.replica.cmp(&na.replica))
            })
            .ok_or_else(|| DistributedError::PlanningError(format!("unknown shard {}", shard)))
    }

    /// One preferred replica per shard, in shard order
    pub fn nodes_for_shards(&self, shards: &[u32]) -> Result<Vec<usize>> {
        shards.iter().map(|&s| self.preferred_replica(s)).collect()
    }
}
