//! Partition pruning: map predicates on the partition key to the shards
//! that can hold matching rows

use crate::topology::ClusterTopology;
use query_core::{Conditions, Predicate, RangeBound, ShardRange, ShardingScheme, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Seed of the routing hash; changing it reshuffles every hash-sharded key
const ROUTING_SEED: u64 = 0x5148_4152_445f_4b45;

/// Outcome of partition pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruningDecision {
    /// No usable partition key predicate; fan out to every shard
    AllShards,
    /// Only these shards (ascending) can hold matching rows
    Shards(Vec<u32>),
}

impl PruningDecision {
    pub fn is_pruned(&self) -> bool {
        matches!(self, PruningDecision::Shards(_))
    }

    /// Concrete shard list, expanding `AllShards` against the topology
    pub fn resolve(&self, topology: &ClusterTopology) -> Vec<u32> {
        match self {
            PruningDecision::AllShards => topology.shard_ids(),
            PruningDecision::Shards(shards) => shards.clone(),
        }
    }
}

/// Routes partition key values to shards according to the sharding scheme
#[derive(Debug, Clone)]
pub struct PartitionPruner {
    partition_key: String,
    scheme: ShardingScheme,
    shard_ids: Vec<u32>,
}

impl PartitionPruner {
    pub fn new(topology: &ClusterTopology) -> Self {
        Self {
            partition_key: topology.config().partition_key.clone(),
            scheme: topology.config().sharding.clone(),
            shard_ids: topology.shard_ids(),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Shard owning `value` under hash sharding. xxh3 keeps the mapping
    /// identical across builds and platforms.
    pub fn hash_shard(&self, value: &Value) -> Option<u32> {
        if self.shard_ids.is_empty() {
            return None;
        }
        let hash = xxh3_64_with_seed(&value.key_bytes(), ROUTING_SEED);
        let slot = (hash % self.shard_ids.len() as u64) as usize;
        Some(self.shard_ids[slot])
    }

    /// Decide which shards a query with `conditions` must touch
    pub fn prune(&self, conditions: &Conditions) -> PruningDecision {
        let Some(predicate) = conditions.get(&self.partition_key) else {
            return PruningDecision::AllShards;
        };

        let decision = match &self.scheme {
            ShardingScheme::Hash => self.prune_hash(predicate),
            ShardingScheme::Range { ranges } => prune_range(ranges, predicate),
        };

        if decision == PruningDecision::AllShards {
            tracing::debug!(
                key = %self.partition_key,
                "partition key predicate cannot be pruned, fanning out to all shards"
            );
        }
        decision
    }

    fn prune_hash(&self, predicate: &Predicate) -> PruningDecision {
        match predicate {
            Predicate::Eq(value) => self.hash_shards([value]),
            Predicate::In(values) => self.hash_shards(values.iter()),
            // hash ranges are not contiguous
            Predicate::Range { .. } | Predicate::Contains(_) => PruningDecision::AllShards,
        }
    }

    fn hash_shards<'a>(&self, values: impl IntoIterator<Item = &'a Value>) -> PruningDecision {
        let shards: BTreeSet<u32> = values
            .into_iter()
            .filter_map(|v| self.hash_shard(v))
            .collect();
        PruningDecision::Shards(shards.into_iter().collect())
    }
}

fn prune_range(ranges: &[ShardRange], predicate: &Predicate) -> PruningDecision {
    // a value no range owns (a gap, or a type the bounds cannot compare
    // against) cannot be routed, so the query keeps every shard
    let owning = |value: &Value| -> Option<u32> {
        ranges
            .iter()
            .find(|r| range_contains(r, value))
            .map(|r| r.shard)
    };
    let owners = |values: &[Value]| -> PruningDecision {
        match values.iter().map(owning).collect::<Option<BTreeSet<u32>>>() {
            Some(shards) => PruningDecision::Shards(shards.into_iter().collect()),
            None => PruningDecision::AllShards,
        }
    };

    match predicate {
        Predicate::Eq(value) => owners(std::slice::from_ref(value)),
        Predicate::In(values) => owners(values),
        Predicate::Range { lower, upper } => {
            let mut shards: Vec<u32> = ranges
                .iter()
                .filter(|r| range_intersects(r, lower.as_ref(), upper.as_ref()))
                .map(|r| r.shard)
                .collect();
            shards.sort_unstable();
            if shards.is_empty() {
                PruningDecision::AllShards
            } else {
                PruningDecision::Shards(shards)
            }
        }
        Predicate::Contains(_) => PruningDecision::AllShards,
    }
}

fn range_contains(range: &ShardRange, value: &Value) -> bool {
    let above = match &range.lower {
        None => true,
        Some(lower) => matches!(value.compare(lower), Some(Ordering::Greater | Ordering::Equal)),
    };
    let below = match &range.upper {
        None => true,
        Some(upper) => matches!(value.compare(upper), Some(Ordering::Less)),
    };
    above && below
}

/// Whether `[lower, upper]` of the predicate overlaps the shard range
/// `[range.lower, range.upper)`. Incomparable bounds keep the shard.
fn range_intersects(
    range: &ShardRange,
    lower: Option<&RangeBound>,
    upper: Option<&RangeBound>,
) -> bool {
    if let (Some(pu), Some(shard_lower)) = (upper, &range.lower) {
        match pu.value.compare(shard_lower) {
            Some(Ordering::Less) => return false,
            Some(Ordering::Equal) if !pu.inclusive => return false,
            _ => {}
        }
    }
    if let (Some(pl), Some(shard_upper)) = (lower, &range.upper) {
        if matches!(
            pl.value.compare(shard_upper),
            Some(Ordering::Greater | Ordering::Equal)
        ) {
            return false;
        }
    }
    true
}
