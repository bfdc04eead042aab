//! Distributed index management and parallel execution
//!
//! # Architecture
//!
//! - **Coordinator**: entry point built from one [`query_core::LayerConfig`]
//! - **Topology**: node list, shard layout and replica choice
//! - **Index manager**: per-node secondary index lifecycle
//! - **Optimizer**: partition pruning, index hints and engine settings
//! - **Executor**: one task per node, fail-fast, merged by a collector
//!
//! Nodes are reached only through a [`StorageAdapter`] supplied by the caller.
//!
//! # Example
//!
//! ```ignore
//! use query_distributed::{Coordinator, QueryRequest};
//! use query_core::{LayerConfig, Predicate, SortField};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = LayerConfig::from_file("layer.json".as_ref())?;
//! let coordinator = Coordinator::new(config, adapter)?;
//!
//! let request = QueryRequest::new("tenant_data", "events", "SELECT * FROM events")
//!     .with_sort(vec![SortField::desc("created_at")])
//!     .with_condition("tenant_id", Predicate::eq("t1"))
//!     .with_estimated_rows(5_000);
//! let output = coordinator.execute(&CancellationToken::new(), &request).await?;
//! ```

pub mod adapter;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod index_manager;
pub mod operators;
pub mod optimizer;
pub mod partition;
pub mod topology;
pub mod types;

// Re-exports
pub use adapter::StorageAdapter;
pub use coordinator::{Chunk, Coordinator};
pub use error::{DistributedError, NodeFailure, Result};
pub use executor::{NodeTarget, ParallelExecutor, QueryOutput};
pub use index_manager::{
    render_create_index, render_drop_index, DistributedIndexManager, IndexDescriptor,
    IndexInfoReport, IndexState, IndexStatus, IndexType,
};
pub use operators::{Merge, MergeStrategy, ResultCollector};
pub use optimizer::{DistributedQueryOptimizer, OptimizedQuery, QueryRequest};
pub use partition::{PartitionPruner, PruningDecision};
pub use topology::ClusterTopology;
pub use types::*;
