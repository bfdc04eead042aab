//! Coordinator: single entry point wiring topology, index manager, optimizer
//! and executor together from one immutable configuration

use crate::adapter::StorageAdapter;
use crate::error::Result;
use crate::executor::{NodeTarget, ParallelExecutor, QueryOutput};
use crate::index_manager::{DistributedIndexManager, IndexInfoReport, IndexStatus, IndexType};
use crate::optimizer::{DistributedQueryOptimizer, OptimizedQuery, QueryRequest};
use crate::topology::ClusterTopology;
use crate::types::{ExecutionStatsSnapshot, QueryId};
use arrow::record_batch::RecordBatch;
use query_core::LayerConfig;
use query_planner::KeysetCursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One chunk of a streaming read
#[derive(Debug, Clone)]
pub struct Chunk {
    pub output: QueryOutput,
    /// Position to resume from; `None` once the result is exhausted
    pub next: Option<KeysetCursor>,
}

/// Coordinator for the distributed index and query layer
pub struct Coordinator {
    config: Arc<LayerConfig>,
    topology: Arc<ClusterTopology>,
    indexes: DistributedIndexManager,
    optimizer: DistributedQueryOptimizer,
    executor: ParallelExecutor,
}

impl Coordinator {
    /// Validate `config` and build every component over `adapter`
    pub fn new(config: LayerConfig, adapter: Arc<dyn StorageAdapter>) -> Result<Self> {
        let topology = Arc::new(ClusterTopology::from_config(&config)?);
        let timeout = config.execution.timeout();

        let indexes =
            DistributedIndexManager::new(Arc::clone(&topology), Arc::clone(&adapter), timeout);
        let optimizer = DistributedQueryOptimizer::new(
            Arc::clone(&topology),
            config.sort_options.clone(),
            config.execution.clone(),
        );
        let executor = ParallelExecutor::new(adapter, timeout);

        tracing::info!(
            cluster = %config.cluster.cluster_name,
            nodes = topology.nodes().len(),
            shards = topology.shard_count(),
            "coordinator ready"
        );

        Ok(Self {
            config: Arc::new(config),
            topology,
            indexes,
            optimizer,
            executor,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn get_cluster_topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn index_manager(&self) -> &DistributedIndexManager {
        &self.indexes
    }

    pub fn stats(&self) -> ExecutionStatsSnapshot {
        self.executor.stats()
    }

    pub async fn create_distributed_index(
        &self,
        table: &str,
        index_name: &str,
        columns: Vec<String>,
        index_type: IndexType,
    ) -> Result<()> {
        self.indexes
            .create_distributed_index(table, index_name, columns, index_type)
            .await
    }

    pub async fn drop_distributed_index(&self, table: &str, index_name: &str) -> Result<()> {
        self.indexes.drop_distributed_index(table, index_name).await
    }

    pub async fn get_distributed_index_info(&self, table: &str) -> Result<IndexInfoReport> {
        self.indexes.get_distributed_index_info(table).await
    }

    pub fn index_state(&self, table: &str, index_name: &str) -> Option<IndexStatus> {
        self.indexes.index_status(table, index_name)
    }

    /// Rewrite a query for the cluster without executing it
    pub fn optimize_distributed_query(&self, request: &QueryRequest) -> Result<OptimizedQuery> {
        let active = self.indexes.indexed_columns(&request.table);
        self.optimizer.optimize(request, &active)
    }

    /// Optimize and run a query. Streaming plans return their first chunk.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &QueryRequest,
    ) -> Result<QueryOutput> {
        let optimized = self.optimize_distributed_query(request)?;
        self.run(cancel, &optimized, &optimized.sql).await
    }

    /// Read the chunk of a streaming plan that follows `cursor`
    pub async fn execute_chunk(
        &self,
        cancel: &CancellationToken,
        optimized: &OptimizedQuery,
        cursor: Option<&KeysetCursor>,
    ) -> Result<Chunk> {
        let sql = optimized.chunk_query(cursor)?;
        let output = self.run(cancel, optimized, &sql).await?;

        let exhausted = optimized
            .limit()
            .map_or(true, |limit| output.num_rows() < limit);
        let next = if exhausted {
            None
        } else {
            match output.batches.iter().rev().find(|b| b.num_rows() > 0) {
                Some(last) => KeysetCursor::from_last_row(last, &optimized.decision.validated)?,
                None => None,
            }
        };
        Ok(Chunk { output, next })
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        optimized: &OptimizedQuery,
        sql: &str,
    ) -> Result<QueryOutput> {
        if optimized.target_nodes.is_empty() {
            tracing::debug!("pruning left no shards, skipping fan-out");
            return Ok(QueryOutput {
                query_id: QueryId::new(),
                batches: Vec::<RecordBatch>::new(),
                nodes: Vec::new(),
                elapsed: Duration::ZERO,
            });
        }

        let targets: Vec<NodeTarget> = optimized
            .target_nodes
            .iter()
            .filter_map(|&idx| {
                self.topology
                    .node(idx)
                    .map(|node| NodeTarget::new(idx, node.clone()))
            })
            .collect();

        self.executor
            .execute_parallel_query(cancel, sql, &targets, optimized.merge())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Behavior, ScriptedAdapter};
    use crate::error::DistributedError;
    use crate::partition::PartitionPruner;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use query_core::{
        ClusterConfig, ExecutionConfig, NodeInfo, Predicate, QueryError, SortField, SortOptions,
        Value,
    };

    fn config() -> LayerConfig {
        LayerConfig::new(
            ClusterConfig::new("analytics", "tenant_id", "tenant_id"),
            vec![
                NodeInfo::new("ch-1", 9000, "events", 1),
                NodeInfo::new("ch-2", 9000, "events", 2),
                NodeInfo::new("ch-3", 9000, "events", 3),
            ],
        )
        .with_entity(
            "tenant_data",
            SortOptions::new(["created_at", "tenant_id"]).with_indexed(["created_at"]),
        )
    }

    fn rows(created: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("tenant_id", DataType::Utf8, false),
            Field::new("created_at", DataType::Int64, false),
        ]));
        let tenants = vec!["t1"; created.len()];
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(tenants)),
                Arc::new(Int64Array::from(created)),
            ],
        )
        .unwrap()
    }

    fn owner_host(coordinator: &Coordinator, tenant: &str) -> String {
        let shard = PartitionPruner::new(coordinator.get_cluster_topology())
            .hash_shard(&Value::from(tenant))
            .unwrap();
        let idx = coordinator
            .get_cluster_topology()
            .preferred_replica(shard)
            .unwrap();
        coordinator.get_cluster_topology().nodes()[idx].host.clone()
    }

    #[tokio::test]
    async fn test_single_tenant_query_hits_one_node() {
        let adapter = ScriptedAdapter::new();
        let coordinator = Coordinator::new(config(), adapter.clone()).unwrap();
        adapter.set(&owner_host(&coordinator, "t1"), Behavior::Rows(vec![rows(vec![3, 2, 1])]));

        let request = QueryRequest::new("tenant_data", "events", "SELECT * FROM events")
            .with_sort(vec![SortField::desc("created_at")])
            .with_condition("tenant_id", Predicate::eq("t1"))
            .with_estimated_rows(100);

        let output = coordinator
            .execute(&CancellationToken::new(), &request)
            .await
            .unwrap();

        assert_eq!(adapter.query_hosts(), vec![owner_host(&coordinator, "t1")]);
        assert_eq!(output.num_rows(), 3);
        assert_eq!(coordinator.stats().node_calls, 1);
    }

    #[tokio::test]
    async fn test_invalid_sort_field_makes_no_node_call() {
        let adapter = ScriptedAdapter::new();
        let coordinator = Coordinator::new(config(), adapter.clone()).unwrap();

        let request = QueryRequest::new("tenant_data", "events", "SELECT * FROM events")
            .with_sort(vec![SortField::asc("created_at"), SortField::asc("status")]);
        let err = coordinator
            .execute(&CancellationToken::new(), &request)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DistributedError::QueryError(QueryError::InvalidField { ref field, .. }) if field == "status"
        ));
        assert!(adapter.query_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_active_index_becomes_hint() {
        let adapter = ScriptedAdapter::new();
        let coordinator = Coordinator::new(config(), adapter.clone()).unwrap();
        coordinator
            .create_distributed_index(
                "events",
                "idx_created",
                vec!["created_at".to_string()],
                IndexType::MinMax,
            )
            .await
            .unwrap();

        let optimized = coordinator
            .optimize_distributed_query(
                &QueryRequest::new("tenant_data", "events", "SELECT * FROM events")
                    .with_sort(vec![SortField::desc("created_at")]),
            )
            .unwrap();
        assert!(optimized.sql.contains("/*+ USE_INDEX(idx_created) */"));
        assert!(coordinator.index_state("events", "idx_created").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_streaming_chunks_follow_cursor() {
        let adapter = ScriptedAdapter::new();
        let config = config().with_execution(
            ExecutionConfig::default()
                .with_max_memory_rows(1)
                .with_chunk_size(2),
        );
        let coordinator = Coordinator::new(config, adapter.clone()).unwrap();
        let host = owner_host(&coordinator, "t1");
        adapter.set(&host, Behavior::Rows(vec![rows(vec![9, 8])]));

        let optimized = coordinator
            .optimize_distributed_query(
                &QueryRequest::new("tenant_data", "events", "SELECT * FROM events")
                    .with_sort(vec![SortField::desc("created_at")])
                    .with_condition("tenant_id", Predicate::eq("t1"))
                    .with_estimated_rows(50),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let first = coordinator.execute_chunk(&cancel, &optimized, None).await.unwrap();
        assert_eq!(first.output.num_rows(), 2);
        let cursor = first.next.unwrap();
        assert_eq!(cursor.values, vec![Value::Int(8)]);

        adapter.set(&host, Behavior::Rows(vec![rows(vec![7])]));
        let second = coordinator
            .execute_chunk(&cancel, &optimized, Some(&cursor))
            .await
            .unwrap();
        assert!(second.next.is_none());

        let queries = adapter.queries.lock().clone();
        assert_eq!(queries.len(), 2);
        assert!(queries[1].1.contains("AND ((created_at < 8 OR created_at IS NULL))"));
        assert!(queries[1].1.contains("LIMIT 2"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = LayerConfig::new(
            ClusterConfig::new("analytics", "tenant_id; DROP", "tenant_id"),
            vec![NodeInfo::new("ch-1", 9000, "events", 1)],
        );
        assert!(Coordinator::new(config, ScriptedAdapter::new()).is_err());
    }
}
