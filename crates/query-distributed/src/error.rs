//! Error types for distributed index management and execution

use std::fmt;
use thiserror::Error;

/// A failure on one node, identified by its position in the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// Index of the node in the topology
    pub node: usize,
    /// `host:port` of the node
    pub address: String,
    /// Underlying failure message
    pub message: String,
}

impl NodeFailure {
    pub fn new(node: usize, address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node,
            address: address.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({}): {}", self.node, self.address, self.message)
    }
}

fn list(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur during distributed execution
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Index creation failed on a subset of nodes; successful nodes keep their index
    #[error("Index '{index}' creation failed on {} node(s): {}", .failures.len(), list(.failures))]
    PartialIndexCreation {
        index: String,
        failures: Vec<NodeFailure>,
    },

    /// Index drop failed on a subset of nodes
    #[error("Index '{index}' drop failed on {} node(s): {}", .failures.len(), list(.failures))]
    PartialIndexDrop {
        index: String,
        failures: Vec<NodeFailure>,
    },

    /// Index name already registered with a different definition
    #[error("Index '{index}' on table '{table}' already exists with a different definition")]
    IndexConflict { table: String, index: String },

    /// Index not registered
    #[error("Index '{index}' not found on table '{table}'")]
    IndexNotFound { table: String, index: String },

    /// One or more nodes did not answer
    #[error("{} node(s) unreachable: {}", .failures.len(), list(.failures))]
    NodeUnreachable { failures: Vec<NodeFailure> },

    /// A node returned an error while executing a query
    #[error("Query failed on {0}")]
    NodeQueryFailed(NodeFailure),

    /// Deadline exceeded
    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    /// Caller cancelled the call
    #[error("Query cancelled")]
    Cancelled,

    /// No nodes selected for execution
    #[error("No nodes available to execute query")]
    NoNodesAvailable,

    /// Storage adapter failure reported by a node connection
    #[error("Storage adapter error: {0}")]
    AdapterError(String),

    /// Query planning error
    #[error("Distributed planning error: {0}")]
    PlanningError(String),

    /// Merge of node results failed
    #[error("Merge error: {0}")]
    MergeError(String),

    /// Validation or configuration error
    #[error(transparent)]
    QueryError(#[from] query_core::QueryError),
}

impl From<arrow::error::ArrowError> for DistributedError {
    fn from(err: arrow::error::ArrowError) -> Self {
        DistributedError::MergeError(err.to_string())
    }
}

/// Result type for distributed operations
pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_creation_names_nodes() {
        let err = DistributedError::PartialIndexCreation {
            index: "idx_created".to_string(),
            failures: vec![
                NodeFailure::new(1, "ch-2:9000", "connection refused"),
                NodeFailure::new(2, "ch-3:9000", "timeout"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("2 node(s)"));
        assert!(message.contains("ch-2:9000"));
        assert!(message.contains("node 2 (ch-3:9000): timeout"));
    }

    #[test]
    fn test_validation_error_is_transparent() {
        let err: DistributedError = query_core::QueryError::UnsafeField("a;b".to_string()).into();
        assert!(err.to_string().contains("a;b"));
    }
}
