//! Layer configuration: cluster topology, per-entity sort options and
//! execution limits. Loaded once at process start and treated as immutable.

use crate::error::{QueryError, Result};
use crate::types::{is_safe_identifier, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

/// A single storage node. Each node holds one replica of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub shard: u32,
    #[serde(default)]
    pub replica: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl NodeInfo {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>, shard: u32) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            shard,
            replica: 0,
            weight: 1,
        }
    }

    pub fn with_replica(mut self, replica: u32) -> Self {
        self.replica = replica;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port` address of the node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (shard {}, replica {})",
            self.host, self.port, self.shard, self.replica
        )
    }
}

/// Where secondary indexes live relative to the data they cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStrategy {
    Local,
    Global,
    Partitioned,
}

impl Default for IndexStrategy {
    fn default() -> Self {
        IndexStrategy::Local
    }
}

/// Half-open key range `[lower, upper)` owned by one shard. A missing bound
/// is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRange {
    pub shard: u32,
    #[serde(default)]
    pub lower: Option<Value>,
    #[serde(default)]
    pub upper: Option<Value>,
}

/// How partition key values map to shards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardingScheme {
    /// Stable hash of the key value modulo the shard count
    Hash,
    /// Ordered, non-overlapping key ranges
    Range { ranges: Vec<ShardRange> },
}

impl Default for ShardingScheme {
    fn default() -> Self {
        ShardingScheme::Hash
    }
}

/// Value type of the partition key. Literals typed on a command line are
/// parsed with it so they route like the stored keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Text,
    Integer,
}

impl KeyType {
    /// Parse a raw literal as a key of this type
    pub fn parse_literal(self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        match self {
            KeyType::Text => Some(Value::from(raw)),
            KeyType::Integer => raw.parse::<i64>().ok().map(Value::Int),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub partition_key: String,
    pub sharding_key: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default)]
    pub index_strategy: IndexStrategy,
    #[serde(default)]
    pub sharding: ShardingScheme,
    #[serde(default)]
    pub partition_key_type: Option<KeyType>,
}

fn default_replication_factor() -> u32 {
    1
}

impl ClusterConfig {
    pub fn new(
        cluster_name: impl Into<String>,
        partition_key: impl Into<String>,
        sharding_key: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            partition_key: partition_key.into(),
            sharding_key: sharding_key.into(),
            replication_factor: 1,
            index_strategy: IndexStrategy::Local,
            sharding: ShardingScheme::Hash,
            partition_key_type: None,
        }
    }

    pub fn with_sharding(mut self, sharding: ShardingScheme) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor;
        self
    }

    pub fn with_index_strategy(mut self, strategy: IndexStrategy) -> Self {
        self.index_strategy = strategy;
        self
    }

    pub fn with_partition_key_type(mut self, key_type: KeyType) -> Self {
        self.partition_key_type = Some(key_type);
        self
    }

    /// Configured partition key type; otherwise the type of the range
    /// bounds, or text for hash sharding
    pub fn key_type(&self) -> KeyType {
        if let Some(key_type) = self.partition_key_type {
            return key_type;
        }
        let ShardingScheme::Range { ranges } = &self.sharding else {
            return KeyType::Text;
        };
        ranges
            .iter()
            .flat_map(|r| r.lower.iter().chain(r.upper.iter()))
            .find_map(|bound| match bound {
                Value::Int(_) => Some(KeyType::Integer),
                Value::String(_) => Some(KeyType::Text),
                _ => None,
            })
            .unwrap_or(KeyType::Text)
    }
}

/// Sort and filter policy of one entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortOptions {
    pub allowed_fields: BTreeSet<String>,
    #[serde(default)]
    pub indexed_fields: BTreeSet<String>,
    /// Fields accepted in where-conditions besides the sortable ones
    #[serde(default)]
    pub filterable_fields: BTreeSet<String>,
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,
    #[serde(default = "default_max_result_size")]
    pub max_result_size: i64,
    #[serde(default)]
    pub force_index_usage: bool,
}

fn default_max_fields() -> usize {
    3
}

fn default_max_result_size() -> i64 {
    1_000_000
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            allowed_fields: BTreeSet::new(),
            indexed_fields: BTreeSet::new(),
            filterable_fields: BTreeSet::new(),
            max_fields: default_max_fields(),
            max_result_size: default_max_result_size(),
            force_index_usage: false,
        }
    }
}

impl SortOptions {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_fields: allowed.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_indexed<I, S>(mut self, indexed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexed_fields = indexed.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filterable<I, S>(mut self, filterable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filterable_fields = filterable.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `field` may appear in a where-condition
    pub fn allows_filter(&self, field: &str) -> bool {
        self.allowed_fields.contains(field)
            || self.indexed_fields.contains(field)
            || self.filterable_fields.contains(field)
    }

    pub fn with_max_fields(mut self, max_fields: usize) -> Self {
        self.max_fields = max_fields;
        self
    }

    pub fn with_max_result_size(mut self, max_result_size: i64) -> Self {
        self.max_result_size = max_result_size;
        self
    }

    pub fn with_force_index_usage(mut self, force: bool) -> Self {
        self.force_index_usage = force;
        self
    }
}

/// Boundary between in-memory and streaming execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_memory_rows: i64,
    pub chunk_size: usize,
    pub query_timeout_seconds: u64,
    #[serde(default)]
    pub index_hints: BTreeMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_memory_rows: 100_000,
            chunk_size: 10_000,
            query_timeout_seconds: 30,
            index_hints: BTreeMap::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn with_max_memory_rows(mut self, rows: i64) -> Self {
        self.max_memory_rows = rows;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.query_timeout_seconds = seconds;
        self
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.query_timeout_seconds)
    }
}

/// Complete configuration surface of the layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub cluster: ClusterConfig,
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub sort_options: BTreeMap<String, SortOptions>,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl LayerConfig {
    pub fn new(cluster: ClusterConfig, nodes: Vec<NodeInfo>) -> Self {
        Self {
            cluster,
            nodes,
            sort_options: BTreeMap::new(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>, options: SortOptions) -> Self {
        self.sort_options.insert(entity.into(), options);
        self
    }

    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: LayerConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn sort_options(&self, entity: &str) -> Result<&SortOptions> {
        self.sort_options
            .get(entity)
            .ok_or_else(|| QueryError::UnknownEntity(entity.to_string()))
    }

    /// Check the structural invariants of the topology and options
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(QueryError::ConfigError(format!(
                "cluster '{}' has no nodes",
                self.cluster.cluster_name
            )));
        }

        for key in [&self.cluster.partition_key, &self.cluster.sharding_key] {
            if !is_safe_identifier(key) {
                return Err(QueryError::UnsafeField(key.clone()));
            }
        }

        if self.cluster.replication_factor == 0 {
            return Err(QueryError::ConfigError(
                "replication_factor must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !is_safe_identifier(&node.database) {
                return Err(QueryError::ConfigError(format!(
                    "node {} has an unsafe database name '{}'",
                    node.address(),
                    node.database
                )));
            }
            if !seen.insert((node.shard, node.replica)) {
                return Err(QueryError::ConfigError(format!(
                    "duplicate (shard {}, replica {}) at node {}",
                    node.shard,
                    node.replica,
                    node.address()
                )));
            }
        }

        if let ShardingScheme::Range { ranges } = &self.cluster.sharding {
            self.validate_ranges(ranges)?;
        }

        for (entity, options) in &self.sort_options {
            if options.max_fields == 0 {
                return Err(QueryError::ConfigError(format!(
                    "entity '{}' allows zero sort fields",
                    entity
                )));
            }
            if let Some(bad) = options
                .allowed_fields
                .iter()
                .chain(options.indexed_fields.iter())
                .chain(options.filterable_fields.iter())
                .find(|f| !is_safe_identifier(f))
            {
                return Err(QueryError::UnsafeField(bad.clone()));
            }
        }

        Ok(())
    }

    fn validate_ranges(&self, ranges: &[ShardRange]) -> Result<()> {
        let shards: HashSet<u32> = self.nodes.iter().map(|n| n.shard).collect();
        if ranges.len() != shards.len() {
            return Err(QueryError::ConfigError(format!(
                "range sharding lists {} ranges for {} shards",
                ranges.len(),
                shards.len()
            )));
        }

        let mut listed = HashSet::new();
        for range in ranges {
            if !shards.contains(&range.shard) {
                return Err(QueryError::ConfigError(format!(
                    "range references unknown shard {}",
                    range.shard
                )));
            }
            if !listed.insert(range.shard) {
                return Err(QueryError::ConfigError(format!(
                    "shard {} owns more than one range",
                    range.shard
                )));
            }
            if let (Some(lower), Some(upper)) = (&range.lower, &range.upper) {
                if lower.compare(upper) != Some(Ordering::Less) {
                    return Err(QueryError::ConfigError(format!(
                        "range of shard {} has lower bound {} not below upper bound {}",
                        range.shard, lower, upper
                    )));
                }
            }
        }

        for pair in ranges.windows(2) {
            let ordered = match (&pair[0].upper, &pair[1].lower) {
                (Some(upper), Some(lower)) => {
                    matches!(upper.compare(lower), Some(Ordering::Less | Ordering::Equal))
                }
                _ => false,
            };
            if !ordered {
                return Err(QueryError::ConfigError(format!(
                    "shard ranges for shards {} and {} are not ascending and disjoint",
                    pair[0].shard, pair[1].shard
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "cluster": {
            "cluster_name": "analytics",
            "partition_key": "tenant_id",
            "sharding_key": "tenant_id",
            "replication_factor": 2
        },
        "nodes": [
            {"host": "ch-1", "port": 9000, "database": "events", "shard": 1, "replica": 0},
            {"host": "ch-2", "port": 9000, "database": "events", "shard": 1, "replica": 1, "weight": 3},
            {"host": "ch-3", "port": 9000, "database": "events", "shard": 2}
        ],
        "sort_options": {
            "analytics_events": {
                "allowed_fields": ["created_at", "tenant_id"],
                "indexed_fields": ["created_at"],
                "max_fields": 2
            }
        },
        "execution": {"max_memory_rows": 5000, "chunk_size": 500, "query_timeout_seconds": 10}
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = LayerConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[1].weight, 3);
        assert_eq!(config.nodes[2].replica, 0);
        assert_eq!(config.cluster.sharding, ShardingScheme::Hash);
        assert_eq!(config.execution.chunk_size, 500);

        let options = config.sort_options("analytics_events").unwrap();
        assert_eq!(options.max_fields, 2);
        assert!(options.allows_filter("created_at"));
        assert!(!options.allows_filter("status"));
        assert!(!options.force_index_usage);
        assert!(matches!(
            config.sort_options("missing"),
            Err(QueryError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = LayerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster.cluster_name, "analytics");
    }

    #[test]
    fn test_duplicate_shard_replica_rejected() {
        let config = LayerConfig::new(
            ClusterConfig::new("c", "tenant_id", "tenant_id"),
            vec![
                NodeInfo::new("a", 9000, "db", 1),
                NodeInfo::new("b", 9000, "db", 1),
            ],
        );
        assert!(matches!(config.validate(), Err(QueryError::ConfigError(_))));
    }

    #[test]
    fn test_unsafe_partition_key_rejected() {
        let config = LayerConfig::new(
            ClusterConfig::new("c", "tenant id", "tenant_id"),
            vec![NodeInfo::new("a", 9000, "db", 1)],
        );
        assert!(matches!(config.validate(), Err(QueryError::UnsafeField(_))));
    }

    #[test]
    fn test_range_scheme_must_be_ordered() {
        let ranges = vec![
            ShardRange {
                shard: 1,
                lower: None,
                upper: Some(Value::Int(100)),
            },
            ShardRange {
                shard: 2,
                lower: Some(Value::Int(50)),
                upper: None,
            },
        ];
        let config = LayerConfig::new(
            ClusterConfig::new("c", "account_id", "account_id")
                .with_sharding(ShardingScheme::Range { ranges }),
            vec![
                NodeInfo::new("a", 9000, "db", 1),
                NodeInfo::new("b", 9000, "db", 2),
            ],
        );
        assert!(matches!(config.validate(), Err(QueryError::ConfigError(_))));
    }

    fn two_shard_range_config(ranges: Vec<ShardRange>) -> LayerConfig {
        LayerConfig::new(
            ClusterConfig::new("c", "account_id", "account_id")
                .with_sharding(ShardingScheme::Range { ranges }),
            vec![
                NodeInfo::new("a", 9000, "db", 1),
                NodeInfo::new("b", 9000, "db", 2),
            ],
        )
    }

    #[test]
    fn test_range_scheme_duplicate_shard_rejected() {
        let config = two_shard_range_config(vec![
            ShardRange {
                shard: 1,
                lower: None,
                upper: Some(Value::Int(100)),
            },
            ShardRange {
                shard: 1,
                lower: Some(Value::Int(100)),
                upper: None,
            },
        ]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, QueryError::ConfigError(msg) if msg.contains("more than one range")));
    }

    #[test]
    fn test_range_scheme_empty_range_rejected() {
        let config = two_shard_range_config(vec![
            ShardRange {
                shard: 1,
                lower: None,
                upper: Some(Value::Int(100)),
            },
            ShardRange {
                shard: 2,
                lower: Some(Value::Int(100)),
                upper: Some(Value::Int(100)),
            },
        ]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, QueryError::ConfigError(msg) if msg.contains("not below")));

        let valid = two_shard_range_config(vec![
            ShardRange {
                shard: 1,
                lower: None,
                upper: Some(Value::Int(100)),
            },
            ShardRange {
                shard: 2,
                lower: Some(Value::Int(100)),
                upper: Some(Value::Int(500)),
            },
        ]);
        valid.validate().unwrap();
    }

    #[test]
    fn test_partition_key_type() {
        let hash = ClusterConfig::new("c", "tenant_id", "tenant_id");
        assert_eq!(hash.key_type(), KeyType::Text);
        assert_eq!(
            hash.clone()
                .with_partition_key_type(KeyType::Integer)
                .key_type(),
            KeyType::Integer
        );

        let ranged = two_shard_range_config(vec![
            ShardRange {
                shard: 1,
                lower: None,
                upper: Some(Value::Int(100)),
            },
            ShardRange {
                shard: 2,
                lower: Some(Value::Int(100)),
                upper: None,
            },
        ]);
        assert_eq!(ranged.cluster.key_type(), KeyType::Integer);

        assert_eq!(KeyType::Text.parse_literal(" 1 "), Some(Value::from("1")));
        assert_eq!(KeyType::Integer.parse_literal("42"), Some(Value::Int(42)));
        assert_eq!(KeyType::Integer.parse_literal("acme"), None);

        let json = r#"{"cluster_name": "c", "partition_key": "account_id",
                       "sharding_key": "account_id", "partition_key_type": "integer"}"#;
        let parsed: ClusterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.key_type(), KeyType::Integer);
    }

    #[test]
    fn test_range_scheme_json() {
        let json = r#"{"type": "range", "ranges": [
            {"shard": 1, "upper": 100},
            {"shard": 2, "lower": 100}
        ]}"#;
        let scheme: ShardingScheme = serde_json::from_str(json).unwrap();
        match scheme {
            ShardingScheme::Range { ranges } => {
                assert_eq!(ranges.len(), 2);
                assert_eq!(ranges[0].upper, Some(Value::Int(100)));
                assert_eq!(ranges[1].lower, Some(Value::Int(100)));
                assert_eq!(ranges[1].upper, None);
            }
            ShardingScheme::Hash => panic!("expected range scheme"),
        }
    }
}
