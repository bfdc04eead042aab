//! Distributed query optimization
//!
//! Turns a base `SELECT` plus validated sort fields and where-conditions into
//! the final statement sent to every target node. The optimizer never talks
//! to the cluster: pruning, hints and settings are derived from the topology,
//! the strategy decision and the set of active distributed indexes.

use crate::error::{DistributedError, Result};
use crate::operators::Merge;
use crate::partition::{PartitionPruner, PruningDecision};
use crate::topology::ClusterTopology;
use query_core::{Conditions, ExecutionConfig, Predicate, SortField, SortOptions};
use query_core::QueryError;
use query_planner::{
    contains_keyword, find_top_level_keyword, generate_order_by_clause, render_conditions,
    sanitize_field, validate_sort_fields_for_scale, ExecutionStrategy, KeysetCursor,
    StrategyDecision,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A query to optimize for the cluster
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Entity whose sort options apply
    pub entity: String,
    pub table: String,
    /// Single `SELECT` without ORDER BY, LIMIT, SETTINGS or `;`
    pub base_query: String,
    pub sort_fields: Vec<SortField>,
    pub conditions: Conditions,
    pub estimated_rows: i64,
}

impl QueryRequest {
    pub fn new(
        entity: impl Into<String>,
        table: impl Into<String>,
        base_query: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            base_query: base_query.into(),
            sort_fields: Vec::new(),
            conditions: Conditions::new(),
            estimated_rows: 0,
        }
    }

    pub fn with_sort(mut self, sort_fields: Vec<SortField>) -> Self {
        self.sort_fields = sort_fields;
        self
    }

    pub fn with_condition(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.conditions.insert(field.into(), predicate);
        self
    }

    pub fn with_estimated_rows(mut self, rows: i64) -> Self {
        self.estimated_rows = rows;
        self
    }
}

/// Pieces of the rewritten statement, kept apart so streaming chunks can
/// add a cursor predicate without re-planning
#[derive(Debug, Clone, Default)]
struct QueryParts {
    hints: Vec<String>,
    /// Base statement up to (not including) its top-level WHERE
    base: String,
    /// Predicate of the base statement's top-level WHERE
    base_predicate: Option<String>,
    filter: Option<String>,
    order_by: String,
    limit: Option<usize>,
    settings: Vec<(String, String)>,
}

impl QueryParts {
    fn render(&self, cursor_predicate: Option<&str>) -> String {
        let mut sql = String::new();
        for hint in &self.hints {
            sql.push_str(hint);
            sql.push(' ');
        }
        sql.push_str(&self.base);

        let mut filters: Vec<String> = Vec::new();
        if let Some(filter) = &self.filter {
            filters.push(filter.clone());
        }
        if let Some(cursor) = cursor_predicate {
            filters.push(format!("({})", cursor));
        }
        if let Some(predicate) = &self.base_predicate {
            if filters.is_empty() {
                filters.push(predicate.clone());
            } else {
                filters.insert(0, format!("({})", predicate));
            }
        }
        if !filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if !self.order_by.is_empty() {
            sql.push(' ');
            sql.push_str(&self.order_by);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if !self.settings.is_empty() {
            let settings: Vec<String> = self
                .settings
                .iter()
                .map(|(k, v)| format!("{} = {}", k, v))
                .collect();
            sql.push_str(&format!(" SETTINGS {}", settings.join(", ")));
        }
        sql
    }
}

/// Output of [`DistributedQueryOptimizer::optimize`]
#[derive(Debug, Clone)]
pub struct OptimizedQuery {
    /// Final statement for the first (or only) read
    pub sql: String,
    pub pruning: PruningDecision,
    /// Shards the query must reach, ascending
    pub target_shards: Vec<u32>,
    /// One node index per target shard
    pub target_nodes: Vec<usize>,
    pub decision: StrategyDecision,
    /// Sort field -> distributed index used for it
    pub index_hints: BTreeMap<String, String>,
    parts: QueryParts,
}

impl OptimizedQuery {
    pub fn strategy(&self) -> ExecutionStrategy {
        self.decision.strategy
    }

    /// Engine settings appended to the statement
    pub fn settings(&self) -> &[(String, String)] {
        &self.parts.settings
    }

    /// Row cap applied per node and after merging
    pub fn limit(&self) -> Option<usize> {
        self.parts.limit
    }

    /// Statement for the chunk following `cursor`. The first chunk has no
    /// cursor and equals [`OptimizedQuery::sql`].
    pub fn chunk_query(&self, cursor: Option<&KeysetCursor>) -> Result<String> {
        if !self.decision.strategy.is_streaming() {
            return Err(DistributedError::PlanningError(
                "chunked reads require a streaming plan".to_string(),
            ));
        }
        match cursor {
            None => Ok(self.sql.clone()),
            Some(cursor) => {
                let predicate = cursor.render_predicate(&self.decision.validated)?;
                Ok(self.parts.render(Some(&predicate)))
            }
        }
    }

    /// How node results are combined: a k-way merge when a sort order was
    /// requested, concatenation otherwise
    pub fn merge(&self) -> Merge {
        let merge = if self.decision.validated.is_empty() {
            Merge::concat()
        } else {
            Merge::sorted(self.decision.validated.clone())
        };
        match self.parts.limit {
            Some(limit) => merge.with_limit(limit),
            None => merge,
        }
    }
}

/// Inputs available to rewrite rules
struct RewriteContext<'a> {
    pruning: &'a PruningDecision,
    target_shards: &'a [u32],
    decision: &'a StrategyDecision,
    index_hints: &'a BTreeMap<String, String>,
}

trait RewriteRule: Send + Sync {
    fn apply(&self, ctx: &RewriteContext<'_>, parts: &mut QueryParts) -> Result<()>;
}

/// Restrict a pruned query to its shards
struct ShardPruning;

impl RewriteRule for ShardPruning {
    fn apply(&self, ctx: &RewriteContext<'_>, parts: &mut QueryParts) -> Result<()> {
        if ctx.pruning.is_pruned() {
            let shards: Vec<String> = ctx.target_shards.iter().map(u32::to_string).collect();
            parts.hints.push(format!("/*+ SHARDS({}) */", shards.join(", ")));
            parts
                .settings
                .push(("optimize_skip_unused_shards".to_string(), "1".to_string()));
        }
        Ok(())
    }
}

/// Point the engine at the distributed index behind each sort field
struct IndexHints;

impl RewriteRule for IndexHints {
    fn apply(&self, ctx: &RewriteContext<'_>, parts: &mut QueryParts) -> Result<()> {
        let mut seen = Vec::new();
        for sort in &ctx.decision.validated {
            if let Some(index) = ctx.index_hints.get(&sort.field) {
                if !seen.contains(index) {
                    parts.hints.push(format!("/*+ USE_INDEX({}) */", index));
                    seen.push(index.clone());
                }
            }
        }
        Ok(())
    }
}

/// Engine settings derived from the execution config
struct ExecutionSettings;

impl RewriteRule for ExecutionSettings {
    fn apply(&self, ctx: &RewriteContext<'_>, parts: &mut QueryParts) -> Result<()> {
        let config = &ctx.decision.config;
        let mut settings = vec![
            (
                "distributed_aggregation_memory_efficient".to_string(),
                "1".to_string(),
            ),
            ("prefer_localhost_replica".to_string(), "1".to_string()),
            (
                "max_execution_time".to_string(),
                config.query_timeout_seconds.to_string(),
            ),
        ];
        if let ExecutionStrategy::Streaming { chunk_size } = ctx.decision.strategy {
            settings.push(("max_block_size".to_string(), chunk_size.to_string()));
        }
        settings.append(&mut parts.settings);
        parts.settings = settings;
        Ok(())
    }
}

/// Rewrites queries for the cluster topology
pub struct DistributedQueryOptimizer {
    topology: Arc<ClusterTopology>,
    pruner: PartitionPruner,
    sort_options: BTreeMap<String, SortOptions>,
    execution: ExecutionConfig,
    rules: Vec<Box<dyn RewriteRule>>,
}

impl DistributedQueryOptimizer {
    pub fn new(
        topology: Arc<ClusterTopology>,
        sort_options: BTreeMap<String, SortOptions>,
        execution: ExecutionConfig,
    ) -> Self {
        let pruner = PartitionPruner::new(&topology);
        Self {
            topology,
            pruner,
            sort_options,
            execution,
            rules: vec![
                Box::new(ShardPruning),
                Box::new(IndexHints),
                Box::new(ExecutionSettings),
            ],
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Rewrite `request` for execution. `active_indexes` maps the leading
    /// column of every active distributed index on the table to its name.
    ///
    /// All validation happens here, before any node is contacted.
    pub fn optimize(
        &self,
        request: &QueryRequest,
        active_indexes: &BTreeMap<String, String>,
    ) -> Result<OptimizedQuery> {
        let opts = self
            .sort_options
            .get(&request.entity)
            .ok_or_else(|| QueryError::UnknownEntity(request.entity.clone()))?;

        let mut decision = validate_sort_fields_for_scale(
            &request.entity,
            &request.sort_fields,
            opts,
            &self.execution,
            request.estimated_rows,
        )?;

        if decision.strategy.is_streaming() && decision.validated.is_empty() {
            return Err(DistributedError::PlanningError(format!(
                "{} estimated rows need streaming, which requires at least one sort field",
                request.estimated_rows
            )));
        }

        sanitize_field(&request.table)?;
        let base = check_base_query(&request.base_query)?;
        self.check_condition_fields(&request.entity, opts, &request.conditions)?;

        let filter = render_conditions(&request.conditions)?;
        let appends_filter = !filter.is_empty() || decision.strategy.is_streaming();
        if appends_filter && contains_keyword(base, "GROUP") {
            return Err(DistributedError::PlanningError(
                "conditions and cursors cannot be appended to a grouped base query".to_string(),
            ));
        }

        let pruning = self.pruner.prune(&request.conditions);
        let target_shards = pruning.resolve(&self.topology);
        let target_nodes = self.topology.nodes_for_shards(&target_shards)?;

        let mut index_hints = BTreeMap::new();
        for sort in &decision.validated {
            if let Some(index) = active_indexes.get(&sort.field) {
                index_hints.insert(sort.field.clone(), index.clone());
                decision
                    .config
                    .index_hints
                    .insert(sort.field.clone(), index.clone());
            }
        }

        let limit = match decision.strategy {
            ExecutionStrategy::Streaming { chunk_size } => chunk_size,
            ExecutionStrategy::InMemory => usize::try_from(opts.max_result_size.max(0))
                .unwrap_or(usize::MAX),
        };

        let (head, base_predicate) = split_where(base)?;
        let mut parts = QueryParts {
            base: head.to_string(),
            base_predicate: base_predicate.map(str::to_string),
            filter: (!filter.is_empty()).then_some(filter),
            order_by: generate_order_by_clause(&decision.validated),
            limit: Some(limit),
            ..QueryParts::default()
        };

        let ctx = RewriteContext {
            pruning: &pruning,
            target_shards: &target_shards,
            decision: &decision,
            index_hints: &index_hints,
        };
        for rule in &self.rules {
            rule.apply(&ctx, &mut parts)?;
        }

        let sql = parts.render(None);
        tracing::debug!(
            entity = %request.entity,
            table = %request.table,
            shards = ?target_shards,
            strategy = %decision.strategy,
            "optimized distributed query"
        );

        Ok(OptimizedQuery {
            sql,
            pruning,
            target_shards,
            target_nodes,
            decision,
            index_hints,
            parts,
        })
    }

    /// Condition fields must be safe and either filterable for the entity
    /// or one of the cluster's routing keys
    fn check_condition_fields(
        &self,
        entity: &str,
        opts: &SortOptions,
        conditions: &Conditions,
    ) -> Result<()> {
        let cluster = self.topology.config();
        for field in conditions.keys() {
            sanitize_field(field)?;
            let routing_key = *field == cluster.partition_key || *field == cluster.sharding_key;
            if !routing_key && !opts.allows_filter(field) {
                return Err(QueryError::InvalidField {
                    field: field.clone(),
                    entity: entity.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Split `base` at its top-level WHERE into the statement head and the
/// predicate
fn split_where(base: &str) -> Result<(&str, Option<&str>)> {
    let Some(pos) = find_top_level_keyword(base, "WHERE") else {
        return Ok((base, None));
    };
    let predicate = base[pos + "WHERE".len()..].trim();
    if predicate.is_empty() {
        return Err(DistributedError::PlanningError(
            "base query has an empty WHERE clause".to_string(),
        ));
    }
    Ok((base[..pos].trim_end(), Some(predicate)))
}

fn check_base_query(base: &str) -> Result<&str> {
    let base = base.trim();
    if base.is_empty() {
        return Err(DistributedError::PlanningError(
            "base query is empty".to_string(),
        ));
    }
    if base.contains(';') {
        return Err(DistributedError::PlanningError(
            "base query must be a single statement without ';'".to_string(),
        ));
    }
    for keyword in ["ORDER", "LIMIT", "SETTINGS"] {
        if contains_keyword(base, keyword) {
            return Err(DistributedError::PlanningError(format!(
                "base query must not contain {}",
                keyword
            )));
        }
    }
    Ok(base)
}
