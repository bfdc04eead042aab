//! Execution strategy selection by estimated result size

use crate::validator::validate_sort_fields;
use query_core::{ExecutionConfig, QueryError, Result, SortField, SortOptions};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a query's results are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// Whole result held in memory
    InMemory,
    /// Keyset-paginated chunks of at most `chunk_size` rows
    Streaming { chunk_size: usize },
}

impl ExecutionStrategy {
    pub fn is_streaming(&self) -> bool {
        matches!(self, ExecutionStrategy::Streaming { .. })
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::InMemory => write!(f, "in-memory"),
            ExecutionStrategy::Streaming { chunk_size } => {
                write!(f, "streaming (chunk size {})", chunk_size)
            }
        }
    }
}

/// Result of [`validate_sort_fields_for_scale`]
#[derive(Debug, Clone)]
pub struct StrategyDecision {
    /// Sort fields after validation, in request order
    pub validated: Vec<SortField>,
    /// Execution config to run with
    pub config: ExecutionConfig,
    pub strategy: ExecutionStrategy,
    pub estimated_rows: i64,
    /// Human readable explanation, for logs and diagnostics
    pub rationale: String,
}

/// Validate sort fields and pick in-memory or streaming execution.
///
/// Streaming is chosen when `estimated_rows > exec.max_memory_rows`. With
/// `force_index_usage`, every sort field of a streaming query must be indexed.
pub fn validate_sort_fields_for_scale(
    entity: &str,
    requested: &[SortField],
    opts: &SortOptions,
    exec: &ExecutionConfig,
    estimated_rows: i64,
) -> Result<StrategyDecision> {
    let validated = validate_sort_fields(entity, requested, opts)?;
    let streaming = estimated_rows > exec.max_memory_rows;

    if streaming && opts.force_index_usage {
        if let Some(missing) = validated
            .iter()
            .find(|s| !opts.indexed_fields.contains(&s.field))
        {
            return Err(QueryError::MissingIndex {
                field: missing.field.clone(),
                entity: entity.to_string(),
            });
        }
    }

    let mut config = exec.clone();
    for sort in &validated {
        if opts.indexed_fields.contains(&sort.field) {
            config
                .index_hints
                .entry(sort.field.clone())
                .or_insert_with(|| sort.field.clone());
        }
    }

    let (strategy, rationale) = if streaming {
        let upper = usize::try_from(estimated_rows).unwrap_or(usize::MAX);
        let chunk_size = exec.chunk_size.clamp(1, upper.max(1));
        config.chunk_size = chunk_size;
        (
            ExecutionStrategy::Streaming { chunk_size },
            format!(
                "estimated {} rows exceeds in-memory limit of {}; streaming in chunks of {} with keyset pagination",
                estimated_rows, exec.max_memory_rows, chunk_size
            ),
        )
    } else {
        (
            ExecutionStrategy::InMemory,
            format!(
                "estimated {} rows within in-memory limit of {}",
                estimated_rows, exec.max_memory_rows
            ),
        )
    };

    tracing::debug!(entity, estimated_rows, %strategy, "selected execution strategy");

    Ok(StrategyDecision {
        validated,
        config,
        strategy,
        estimated_rows,
        rationale,
    })
}
