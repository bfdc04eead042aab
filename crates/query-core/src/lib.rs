//! Shared building blocks for the distributed index layer
//!
//! - [`types`]: sort keys, scalar values and field predicates
//! - [`config`]: cluster topology, per-entity sort options, execution limits
//! - [`error`]: validation and configuration errors

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    ClusterConfig, ExecutionConfig, IndexStrategy, KeyType, LayerConfig, NodeInfo, ShardRange,
    ShardingScheme, SortOptions,
};
pub use error::{QueryError, Result};
pub use types::*;
