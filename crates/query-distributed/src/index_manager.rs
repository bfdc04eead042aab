//! Distributed secondary index management
//!
//! A distributed index is a set of node-local data-skipping indexes, one per
//! node, named `<index>_node_<i>`. Each node moves through
//! `Requested -> Creating -> Active -> Dropping -> Absent`; the distributed
//! index counts as active only when every node is active.

use crate::adapter::StorageAdapter;
use crate::error::{DistributedError, NodeFailure, Result};
use crate::topology::ClusterTopology;
use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use query_core::{NodeInfo, QueryError, Value};
use query_planner::{render_literal, sanitize_field};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Supported data-skipping index types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    MinMax,
    BloomFilter,
    Set,
}

impl IndexType {
    fn ddl(&self) -> &'static str {
        match self {
            IndexType::MinMax => "minmax",
            IndexType::BloomFilter => "bloom_filter(0.01)",
            IndexType::Set => "set(100)",
        }
    }

    /// Parse an engine type name such as `bloom_filter` or `set(100)`
    pub fn parse(name: &str) -> Option<Self> {
        let base = name.split('(').next().unwrap_or(name).trim();
        match base.to_ascii_lowercase().as_str() {
            "minmax" => Some(IndexType::MinMax),
            "bloom_filter" => Some(IndexType::BloomFilter),
            "set" => Some(IndexType::Set),
            _ => None,
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::MinMax => write!(f, "MINMAX"),
            IndexType::BloomFilter => write!(f, "BLOOM_FILTER"),
            IndexType::Set => write!(f, "SET"),
        }
    }
}

/// Definition of a secondary index on a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub table_name: String,
    pub index_name: String,
    /// Indexed columns, in order
    pub columns: Vec<String>,
    pub index_type: IndexType,
}

impl IndexDescriptor {
    pub fn new(
        table_name: impl Into<String>,
        index_name: impl Into<String>,
        columns: Vec<String>,
        index_type: IndexType,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            index_name: index_name.into(),
            columns,
            index_type,
        }
    }

    /// Name of the node-local counterpart on node `node`
    pub fn node_index_name(&self, node: usize) -> String {
        format!("{}_node_{}", self.index_name, node)
    }

    /// Column this index can accelerate a sort on
    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(String::as_str)
    }

    fn validate(&self) -> std::result::Result<(), QueryError> {
        sanitize_field(&self.table_name)?;
        sanitize_field(&self.index_name)?;
        if self.columns.is_empty() {
            return Err(QueryError::PlanningError(format!(
                "index '{}' has no columns",
                self.index_name
            )));
        }
        for column in &self.columns {
            sanitize_field(column)?;
        }
        Ok(())
    }
}

/// Lifecycle state of one node-local index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Requested,
    Creating,
    Active,
    Dropping,
    Absent,
}

/// Aggregate and per-node state of a distributed index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatus {
    pub descriptor: IndexDescriptor,
    pub nodes: Vec<IndexState>,
}

impl IndexStatus {
    /// Active only when every node reports active
    pub fn is_active(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|s| *s == IndexState::Active)
    }

    /// Nodes whose local index is not active
    pub fn inactive_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != IndexState::Active)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of per-node index introspection. Unreachable nodes are missing
/// from `by_node` and listed in `error`.
#[derive(Debug)]
pub struct IndexInfoReport {
    pub by_node: BTreeMap<usize, Vec<IndexDescriptor>>,
    pub error: Option<DistributedError>,
}

impl IndexInfoReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

type IndexKey = (String, String);

/// Render the node-local `ADD INDEX` statement
pub fn render_create_index(
    node: &NodeInfo,
    descriptor: &IndexDescriptor,
    node_idx: usize,
    granularity: u32,
) -> std::result::Result<String, QueryError> {
    descriptor.validate()?;
    let database = sanitize_field(&node.database)?;
    Ok(format!(
        "ALTER TABLE {}.{} ADD INDEX IF NOT EXISTS {} ({}) TYPE {} GRANULARITY {}",
        database,
        descriptor.table_name,
        descriptor.node_index_name(node_idx),
        descriptor.columns.join(", "),
        descriptor.index_type.ddl(),
        granularity
    ))
}

/// Render the node-local `DROP INDEX` statement
pub fn render_drop_index(
    node: &NodeInfo,
    descriptor: &IndexDescriptor,
    node_idx: usize,
) -> std::result::Result<String, QueryError> {
    descriptor.validate()?;
    let database = sanitize_field(&node.database)?;
    Ok(format!(
        "ALTER TABLE {}.{} DROP INDEX IF EXISTS {}",
        database,
        descriptor.table_name,
        descriptor.node_index_name(node_idx)
    ))
}

/// Manager for distributed secondary indexes
pub struct DistributedIndexManager {
    topology: Arc<ClusterTopology>,
    adapter: Arc<dyn StorageAdapter>,
    /// (table, index) -> per-node lifecycle
    registry: DashMap<IndexKey, IndexStatus>,
    /// Serializes create/drop of the same (table, index)
    locks: DashMap<IndexKey, Arc<tokio::sync::Mutex<()>>>,
    node_timeout: Duration,
    granularity: u32,
}

impl DistributedIndexManager {
    pub fn new(
        topology: Arc<ClusterTopology>,
        adapter: Arc<dyn StorageAdapter>,
        node_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            adapter,
            registry: DashMap::new(),
            locks: DashMap::new(),
            node_timeout,
            granularity: 4,
        }
    }

    /// Set the GRANULARITY used for new indexes
    pub fn with_granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    fn lock_for(&self, key: &IndexKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn set_state(&self, key: &IndexKey, node: usize, state: IndexState) {
        if let Some(mut status) = self.registry.get_mut(key) {
            if let Some(slot) = status.nodes.get_mut(node) {
                *slot = state;
            }
        }
    }

    fn node_state(&self, key: &IndexKey, node: usize) -> Option<IndexState> {
        self.registry
            .get(key)
            .and_then(|status| status.nodes.get(node).copied())
    }

    async fn exec_with_timeout(&self, node: &NodeInfo, ddl: &str) -> std::result::Result<(), String> {
        match tokio::time::timeout(self.node_timeout, self.adapter.exec(node, ddl)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}ms",
                self.node_timeout.as_millis()
            )),
        }
    }

    /// Create `index_name` on every node. Nodes that already hold the active
    /// index are skipped, so repeating a successful call is a no-op. Failed
    /// nodes are reported; nodes that succeeded keep their index. If no node
    /// ends up holding it, the definition is forgotten and the name is free.
    pub async fn create_distributed_index(
        &self,
        table: &str,
        index_name: &str,
        columns: Vec<String>,
        index_type: IndexType,
    ) -> Result<()> {
        let descriptor = IndexDescriptor::new(table, index_name, columns, index_type);
        descriptor.validate()?;

        let key = (table.to_string(), index_name.to_string());
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let node_count = self.topology.nodes().len();
        {
            let mut entry = self
                .registry
                .entry(key.clone())
                .or_insert_with(|| IndexStatus {
                    descriptor: descriptor.clone(),
                    nodes: vec![IndexState::Requested; node_count],
                });
            if entry.descriptor != descriptor {
                return Err(DistributedError::IndexConflict {
                    table: table.to_string(),
                    index: index_name.to_string(),
                });
            }
            if entry.is_active() {
                tracing::debug!(table, index = index_name, "index already active on all nodes");
                return Ok(());
            }
            for state in entry.nodes.iter_mut() {
                if *state != IndexState::Active {
                    *state = IndexState::Requested;
                }
            }
        }

        let mut failures = Vec::new();
        for (idx, node) in self.topology.nodes().iter().enumerate() {
            if self.node_state(&key, idx) == Some(IndexState::Active) {
                continue;
            }
            self.set_state(&key, idx, IndexState::Creating);

            let ddl = render_create_index(node, &descriptor, idx, self.granularity)?;
            tracing::debug!(node = %node, %ddl, "creating node-local index");

            match self.exec_with_timeout(node, &ddl).await {
                Ok(()) => self.set_state(&key, idx, IndexState::Active),
                Err(message) => {
                    tracing::warn!(node = %node, index = index_name, %message, "index creation failed");
                    self.set_state(&key, idx, IndexState::Absent);
                    failures.push(NodeFailure::new(idx, node.address(), message));
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(table, index = index_name, nodes = node_count, "distributed index active");
            Ok(())
        } else {
            // no node holds the index, so the definition is not pinned
            self.registry.remove_if(&key, |_, status| {
                status.nodes.iter().all(|s| *s != IndexState::Active)
            });
            Err(DistributedError::PartialIndexCreation {
                index: index_name.to_string(),
                failures,
            })
        }
    }

    /// Drop `index_name` from every node that may hold it
    pub async fn drop_distributed_index(&self, table: &str, index_name: &str) -> Result<()> {
        let key = (table.to_string(), index_name.to_string());
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let descriptor = self
            .registry
            .get(&key)
            .map(|status| status.descriptor.clone())
            .ok_or_else(|| DistributedError::IndexNotFound {
                table: table.to_string(),
                index: index_name.to_string(),
            })?;

        let mut failures = Vec::new();
        for (idx, node) in self.topology.nodes().iter().enumerate() {
            let previous = match self.node_state(&key, idx) {
                Some(IndexState::Absent) | None => continue,
                Some(state) => state,
            };
            self.set_state(&key, idx, IndexState::Dropping);

            let ddl = render_drop_index(node, &descriptor, idx)?;
            match self.exec_with_timeout(node, &ddl).await {
                Ok(()) => self.set_state(&key, idx, IndexState::Absent),
                Err(message) => {
                    tracing::warn!(node = %node, index = index_name, %message, "index drop failed");
                    self.set_state(&key, idx, previous);
                    failures.push(NodeFailure::new(idx, node.address(), message));
                }
            }
        }

        if failures.is_empty() {
            self.registry.remove(&key);
            tracing::info!(table, index = index_name, "distributed index dropped");
            Ok(())
        } else {
            Err(DistributedError::PartialIndexDrop {
                index: index_name.to_string(),
                failures,
            })
        }
    }

    /// Lifecycle state of one distributed index
    pub fn index_status(&self, table: &str, index_name: &str) -> Option<IndexStatus> {
        self.registry
            .get(&(table.to_string(), index_name.to_string()))
            .map(|status| status.clone())
    }

    /// All registered indexes on `table`, ordered by name
    pub fn list_indexes(&self, table: &str) -> Vec<IndexStatus> {
        let mut statuses: Vec<IndexStatus> = self
            .registry
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| entry.value().clone())
            .collect();
        statuses.sort_by(|a, b| a.descriptor.index_name.cmp(&b.descriptor.index_name));
        statuses
    }

    /// Leading column -> index name for every active index on `table`.
    /// When several indexes share a leading column the first by name wins.
    pub fn indexed_columns(&self, table: &str) -> BTreeMap<String, String> {
        let mut columns = BTreeMap::new();
        for status in self.list_indexes(table) {
            if !status.is_active() {
                continue;
            }
            if let Some(column) = status.descriptor.leading_column() {
                columns
                    .entry(column.to_string())
                    .or_insert_with(|| status.descriptor.index_name.clone());
            }
        }
        columns
    }

    /// Ask every node which indexes it holds for `table`. Nodes that fail or
    /// time out are left out of the map and reported in the error.
    pub async fn get_distributed_index_info(&self, table: &str) -> Result<IndexInfoReport> {
        sanitize_field(table)?;

        let mut tasks = JoinSet::new();
        for (idx, node) in self.topology.nodes().iter().enumerate() {
            let sql = format!(
                "SELECT name, expr, type FROM system.data_skipping_indices WHERE database = {} AND table = {}",
                render_literal(&Value::from(node.database.as_str()))?,
                render_literal(&Value::from(table))?
            );
            let adapter = Arc::clone(&self.adapter);
            let node = node.clone();
            let timeout = self.node_timeout;
            let table = table.to_string();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, adapter.query(&node, &sql)).await {
                    Ok(Ok(batches)) => parse_index_rows(&table, &batches).map_err(|e| e.to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                };
                (idx, node.address(), outcome)
            });
        }

        let mut by_node = BTreeMap::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, _, Ok(indexes))) => {
                    by_node.insert(idx, indexes);
                }
                Ok((idx, address, Err(message))) => {
                    tracing::warn!(node = idx, %address, %message, "index introspection failed");
                    failures.push(NodeFailure::new(idx, address, message));
                }
                Err(join_error) => {
                    return Err(DistributedError::AdapterError(join_error.to_string()));
                }
            }
        }
        failures.sort_by_key(|f| f.node);

        let error = if failures.is_empty() {
            None
        } else {
            Some(DistributedError::NodeUnreachable { failures })
        };
        Ok(IndexInfoReport { by_node, error })
    }
}

/// Parse `name`, `expr`, `type` rows returned by index introspection
fn parse_index_rows(table: &str, batches: &[RecordBatch]) -> Result<Vec<IndexDescriptor>> {
    let mut indexes = Vec::new();
    for batch in batches {
        let column = |name: &str| -> Result<&StringArray> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| {
                    DistributedError::AdapterError(format!(
                        "index listing is missing string column '{}'",
                        name
                    ))
                })
        };
        let names = column("name")?;
        let exprs = column("expr")?;
        let types = column("type")?;

        for row in 0..batch.num_rows() {
            if names.is_null(row) {
                continue;
            }
            let Some(index_type) = IndexType::parse(types.value(row)) else {
                tracing::debug!(index = names.value(row), kind = types.value(row), "skipping unsupported index type");
                continue;
            };
            let columns = exprs
                .value(row)
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            indexes.push(IndexDescriptor::new(
                table,
                names.value(row),
                columns,
                index_type,
            ));
        }
    }
    Ok(indexes)
}
