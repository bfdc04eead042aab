//! Parallel fan-out executor
//!
//! Runs one query on a set of nodes concurrently, one task per node, and
//! reduces the answers through a [`ResultCollector`]. The first node error,
//! the deadline or the caller's cancellation token stops every task still in
//! flight before the call returns.

use crate::adapter::StorageAdapter;
use crate::error::{DistributedError, NodeFailure, Result};
use crate::operators::{Merge, ResultCollector};
use crate::types::{ExecutionStats, ExecutionStatsSnapshot, QueryId};
use arrow::record_batch::RecordBatch;
use query_core::NodeInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A node addressed by its position in the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub index: usize,
    pub node: NodeInfo,
}

impl NodeTarget {
    pub fn new(index: usize, node: NodeInfo) -> Self {
        Self { index, node }
    }
}

/// Merged result of a fan-out call
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub query_id: QueryId,
    pub batches: Vec<RecordBatch>,
    /// Node indexes that answered, ascending
    pub nodes: Vec<usize>,
    pub elapsed: Duration,
}

impl QueryOutput {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Fans a query out to nodes through a [`StorageAdapter`]
pub struct ParallelExecutor {
    adapter: Arc<dyn StorageAdapter>,
    timeout: Duration,
    stats: ExecutionStats,
}

impl ParallelExecutor {
    pub fn new(adapter: Arc<dyn StorageAdapter>, timeout: Duration) -> Self {
        Self {
            adapter,
            timeout,
            stats: ExecutionStats::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> ExecutionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `sql` on every target and merge the answers.
    ///
    /// Fails fast: the first node error aborts the remaining tasks and is
    /// returned with the node it came from. Partial results are discarded.
    pub async fn execute_parallel_query(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        targets: &[NodeTarget],
        merge: Merge,
    ) -> Result<QueryOutput> {
        if targets.is_empty() {
            return Err(DistributedError::NoNodesAvailable);
        }

        let query_id = QueryId::new();
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        self.stats.record_query(targets.len());

        tracing::debug!(%query_id, nodes = targets.len(), "fanning out query");

        let sql: Arc<str> = Arc::from(sql);
        let mut tasks = JoinSet::new();
        for target in targets {
            let adapter = Arc::clone(&self.adapter);
            let sql = Arc::clone(&sql);
            let target = target.clone();
            tasks.spawn(async move {
                let outcome = adapter.query(&target.node, &sql).await;
                (target, outcome)
            });
        }

        let mut collector = ResultCollector::new(targets.len(), merge);
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(DistributedError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(DistributedError::Timeout(self.timeout.as_millis() as u64));
                }
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((target, Ok(batches)))) => {
                        tracing::debug!(%query_id, node = target.index, "node answered");
                        collector.add_result(target.index, batches);
                    }
                    Some(Ok((target, Err(e)))) => {
                        break Err(DistributedError::NodeQueryFailed(NodeFailure::new(
                            target.index,
                            target.node.address(),
                            e.to_string(),
                        )));
                    }
                    Some(Err(join_error)) => {
                        break Err(DistributedError::AdapterError(join_error.to_string()));
                    }
                }
            }
        };

        if let Err(e) = outcome {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}

            match &e {
                DistributedError::Timeout(_) => self.stats.record_timeout(),
                _ => self.stats.record_failure(),
            }
            tracing::warn!(%query_id, error = %e, "parallel query failed");
            return Err(e);
        }

        let nodes = targets.iter().map(|t| t.index).collect::<std::collections::BTreeSet<_>>();
        let batches = collector.finalize()?;
        let output = QueryOutput {
            query_id,
            batches,
            nodes: nodes.into_iter().collect(),
            elapsed: start.elapsed(),
        };
        self.stats.record_rows(output.num_rows());

        tracing::info!(
            %query_id,
            nodes = output.nodes.len(),
            rows = output.num_rows(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "parallel query completed"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Behavior, ScriptedAdapter};
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use query_core::SortField;

    fn batch(ids: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids))]).unwrap()
    }

    fn targets(n: usize) -> Vec<NodeTarget> {
        (0..n)
            .map(|i| {
                NodeTarget::new(
                    i,
                    NodeInfo::new(format!("ch-{}", i + 1), 9000, "events", i as u32 + 1),
                )
            })
            .collect()
    }

    fn ids(output: &QueryOutput) -> Vec<i64> {
        output
            .batches
            .iter()
            .flat_map(|b| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fan_out_concat_in_node_order() {
        let adapter = ScriptedAdapter::new();
        adapter.set(
            "ch-1",
            Behavior::Delay(Duration::from_millis(30), vec![batch(vec![1, 2])]),
        );
        adapter.set("ch-2", Behavior::Rows(vec![batch(vec![3])]));
        adapter.set("ch-3", Behavior::Rows(vec![batch(vec![4, 5])]));
        let executor = ParallelExecutor::new(adapter.clone(), Duration::from_secs(5));

        let output = executor
            .execute_parallel_query(
                &CancellationToken::new(),
                "SELECT id FROM events",
                &targets(3),
                Merge::concat(),
            )
            .await
            .unwrap();

        assert_eq!(ids(&output), vec![1, 2, 3, 4, 5]);
        assert_eq!(output.nodes, vec![0, 1, 2]);
        assert_eq!(adapter.query_hosts().len(), 3);

        let stats = executor.stats();
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.node_calls, 3);
        assert_eq!(stats.rows_returned, 5);
    }

    #[tokio::test]
    async fn test_fan_out_sorted_merge() {
        let adapter = ScriptedAdapter::new();
        adapter.set("ch-1", Behavior::Rows(vec![batch(vec![9, 5, 1])]));
        adapter.set("ch-2", Behavior::Rows(vec![batch(vec![8, 6, 2])]));
        let executor = ParallelExecutor::new(adapter, Duration::from_secs(5));

        let output = executor
            .execute_parallel_query(
                &CancellationToken::new(),
                "SELECT id FROM events ORDER BY id DESC",
                &targets(2),
                Merge::sorted(vec![SortField::desc("id")]).with_limit(4),
            )
            .await
            .unwrap();
        assert_eq!(ids(&output), vec![9, 8, 6, 5]);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_other_nodes() {
        let adapter = ScriptedAdapter::new();
        adapter.set("ch-1", Behavior::Hang);
        adapter.set("ch-2", Behavior::Fail("too many parts".to_string()));
        adapter.set(
            "ch-3",
            Behavior::Delay(Duration::from_secs(5), vec![batch(vec![1])]),
        );
        let executor = ParallelExecutor::new(adapter.clone(), Duration::from_secs(10));

        let start = Instant::now();
        let err = executor
            .execute_parallel_query(&CancellationToken::new(), "SELECT 1", &targets(3), Merge::concat())
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(2));
        match err {
            DistributedError::NodeQueryFailed(failure) => {
                assert_eq!(failure.node, 1);
                assert_eq!(failure.address, "ch-2:9000");
                assert!(failure.message.contains("too many parts"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // the hanging and slow nodes were aborted, not left running
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*adapter.finished.lock(), vec!["ch-2".to_string()]);
        assert_eq!(executor.stats().failed_queries, 1);
    }

    #[tokio::test]
    async fn test_deadline_returns_timeout() {
        let adapter = ScriptedAdapter::new();
        adapter.set("ch-2", Behavior::Hang);
        let executor = ParallelExecutor::new(adapter, Duration::from_millis(50));

        let start = Instant::now();
        let err = executor
            .execute_parallel_query(&CancellationToken::new(), "SELECT 1", &targets(2), Merge::concat())
            .await
            .unwrap_err();

        assert!(matches!(err, DistributedError::Timeout(50)));
        assert!(start.elapsed() < Duration::from_secs(1));
        let stats = executor.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failed_queries, 1);
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let adapter = ScriptedAdapter::new();
        adapter.set("ch-1", Behavior::Hang);
        let executor = ParallelExecutor::new(adapter, Duration::from_secs(10));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor
            .execute_parallel_query(&cancel, "SELECT 1", &targets(1), Merge::concat())
            .await
            .unwrap_err();
        assert!(matches!(err, DistributedError::Cancelled));
    }

    #[tokio::test]
    async fn test_no_targets() {
        let executor = ParallelExecutor::new(ScriptedAdapter::new(), Duration::from_secs(1));
        let err = executor
            .execute_parallel_query(&CancellationToken::new(), "SELECT 1", &[], Merge::concat())
            .await
            .unwrap_err();
        assert!(matches!(err, DistributedError::NoNodesAvailable));
    }
}
