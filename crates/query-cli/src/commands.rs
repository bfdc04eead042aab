use crate::config::OutputFormat;
use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use colored::Colorize;
use comfy_table::{Cell, Color, Table as ComfyTable};
use query_core::{ClusterConfig, Conditions, LayerConfig, NodeInfo, Predicate, RangeBound, Value};
use query_distributed::{ClusterTopology, Coordinator, DistributedError, QueryRequest, StorageAdapter};
use query_index::{
    default_record_sort_options, read_snapshot, CrossFileQueryService, MetadataIndexStore,
    SearchRequest,
};
use query_planner::{
    generate_order_by_clause, parse_sort_spec, validate_sort_fields, validate_sort_fields_for_scale,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Adapter used when planning without a live cluster; every node call fails
struct OfflineAdapter;

#[async_trait]
impl StorageAdapter for OfflineAdapter {
    async fn query(&self, node: &NodeInfo, _sql: &str) -> query_distributed::Result<Vec<RecordBatch>> {
        Err(DistributedError::AdapterError(format!(
            "{} is not reachable in offline mode",
            node.address()
        )))
    }

    async fn exec(&self, node: &NodeInfo, _ddl: &str) -> query_distributed::Result<()> {
        Err(DistributedError::AdapterError(format!(
            "{} is not reachable in offline mode",
            node.address()
        )))
    }
}

pub fn show_topology(config: &LayerConfig) -> Result<()> {
    let topology = ClusterTopology::from_config(config)?;
    let cluster = topology.config();

    println!("{}", format!("Cluster '{}'", cluster.cluster_name).bright_yellow().bold());
    println!("  Partition key:   {}", cluster.partition_key.bright_cyan());
    println!("  Sharding key:    {}", cluster.sharding_key.bright_cyan());
    println!("  Replication:     {}", cluster.replication_factor);
    println!("  Index strategy:  {:?}", cluster.index_strategy);
    println!();

    let preferred: Vec<usize> = topology
        .shard_ids()
        .into_iter()
        .map(|shard| topology.preferred_replica(shard))
        .collect::<query_distributed::Result<_>>()?;

    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Address").fg(Color::Yellow),
        Cell::new("Shard").fg(Color::Green),
        Cell::new("Replica").fg(Color::Magenta),
        Cell::new("Weight").fg(Color::Blue),
        Cell::new("Preferred").fg(Color::Cyan),
    ]);
    for (idx, node) in topology.nodes().iter().enumerate() {
        let marker = if preferred.contains(&idx) {
            Cell::new("*").fg(Color::Green)
        } else {
            Cell::new("")
        };
        table.add_row(vec![
            Cell::new(idx),
            Cell::new(node.address()),
            Cell::new(node.shard),
            Cell::new(node.replica),
            Cell::new(node.weight),
            marker,
        ]);
    }
    println!("{}", table);
    println!(
        "  {} shard(s), {} node(s); {} marks the preferred replica",
        topology.shard_count(),
        topology.nodes().len(),
        "*".bright_green()
    );
    Ok(())
}

pub fn validate_sort(config: &LayerConfig, entity: &str, sort: &str) -> Result<()> {
    let requested = parse_sort_spec(sort)?;
    let opts = config.sort_options(entity)?;
    let validated = validate_sort_fields(entity, &requested, opts)?;

    println!("{} Sort fields valid for '{}'", "✓".bright_green(), entity);
    let clause = generate_order_by_clause(&validated);
    if clause.is_empty() {
        println!("  {}", "(no ordering)".bright_black());
    } else {
        println!("  {}", clause.bright_white());
    }
    Ok(())
}

pub fn plan_strategy(config: &LayerConfig, entity: &str, sort: &str, rows: i64) -> Result<()> {
    let requested = parse_sort_spec(sort)?;
    let opts = config.sort_options(entity)?;
    let decision =
        validate_sort_fields_for_scale(entity, &requested, opts, &config.execution, rows)?;

    println!("{}", "Execution Strategy:".bright_yellow().bold());
    println!("  Strategy:        {}", decision.strategy.to_string().bright_cyan());
    println!("  Estimated rows:  {}", decision.estimated_rows);
    println!("  Memory limit:    {}", decision.config.max_memory_rows);
    println!("  Chunk size:      {}", decision.config.chunk_size);
    if !decision.config.index_hints.is_empty() {
        let hints: Vec<String> = decision
            .config
            .index_hints
            .iter()
            .map(|(field, index)| format!("{} -> {}", field, index))
            .collect();
        println!("  Index hints:     {}", hints.join(", "));
    }
    println!("  {}", decision.rationale.bright_black());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn optimize_query(
    config: &LayerConfig,
    entity: &str,
    table: &str,
    query: &str,
    sort: &str,
    conditions: &[String],
    rows: i64,
) -> Result<()> {
    let start = Instant::now();
    let coordinator = Coordinator::new(config.clone(), Arc::new(OfflineAdapter))?;

    let mut request = QueryRequest::new(entity, table, query)
        .with_sort(parse_sort_spec(sort)?)
        .with_estimated_rows(rows);
    request.conditions = parse_conditions(conditions, Some(&config.cluster))?;

    let optimized = coordinator.optimize_distributed_query(&request)?;
    let topology = coordinator.get_cluster_topology();

    println!("{} Query optimized in {:.2?}", "✓".bright_green(), start.elapsed());
    println!();
    println!("{}", optimized.sql.bright_white());
    println!();
    println!("  Strategy:   {}", optimized.strategy().to_string().bright_cyan());
    if optimized.pruning.is_pruned() {
        println!("  Shards:     {:?} (pruned)", optimized.target_shards);
    } else {
        println!("  Shards:     {:?}", optimized.target_shards);
    }
    let nodes: Vec<String> = optimized
        .target_nodes
        .iter()
        .filter_map(|&idx| topology.node(idx).map(NodeInfo::address))
        .collect();
    println!("  Nodes:      {}", nodes.join(", "));
    Ok(())
}

/// Arguments of the `search` command
pub struct SearchArgs {
    pub tenant: String,
    pub source: Option<String>,
    pub conditions: Vec<String>,
    pub sort: String,
    pub limit: usize,
    pub output: OutputFormat,
}

pub fn search_snapshot(snapshot: &Path, args: &SearchArgs) -> Result<()> {
    if !snapshot.exists() {
        anyhow::bail!("Snapshot not found: {:?}", snapshot);
    }

    let start = Instant::now();
    let records = read_snapshot(snapshot)
        .with_context(|| format!("failed to read snapshot {}", snapshot.display()))?;

    let store = Arc::new(MetadataIndexStore::new());
    store.restore_records(records);
    let service = CrossFileQueryService::new(store, default_record_sort_options());

    let mut request = SearchRequest::new(args.tenant.as_str())
        .with_sort(parse_sort_spec(&args.sort)?)
        .with_limit(args.limit);
    request.source_id = args.source.clone();
    request.conditions = parse_conditions(&args.conditions, None)?;

    let result = service.search_records_across_files(&request)?;

    match args.output {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "records": result.records,
                "file_hints": result.file_hints,
                "total_matched": result.total_matched,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Table => {
            let mut table = ComfyTable::new();
            table.set_header(vec![
                Cell::new("Record").fg(Color::Cyan),
                Cell::new("Location").fg(Color::Yellow),
                Cell::new("Name").fg(Color::Green),
                Cell::new("Status").fg(Color::Magenta),
                Cell::new("Created").fg(Color::Blue),
            ]);
            for record in &result.records {
                table.add_row(vec![
                    record.record_id.clone(),
                    format!("{}:{}", record.file_id, record.row_number),
                    record.name.clone().unwrap_or_else(|| "-".to_string()),
                    record.status.clone().unwrap_or_else(|| "-".to_string()),
                    record.created_at.to_rfc3339(),
                ]);
            }
            println!("{}", table);
            println!();
            println!("{}", "Files:".bright_yellow().bold());
            for hint in &result.file_hints {
                println!("  {} rows {:?}", hint.file_path.bright_cyan(), hint.row_numbers);
            }
            println!(
                "\n{} {} of {} matching record(s) in {:.2?}",
                "✓".bright_green(),
                result.records.len(),
                result.total_matched,
                start.elapsed()
            );
        }
    }
    Ok(())
}

/// Parse a literal: booleans and numbers are typed, anything else is text
fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::Float(f),
        _ => Value::from(raw),
    }
}

/// Parse one condition: `f=v`, `f=a|b`, `f~text`, `f>v`, `f>=v`, `f<v`, `f<=v`.
/// Literals on the partition key of `cluster` take the key's type.
fn parse_condition(spec: &str, cluster: Option<&ClusterConfig>) -> Result<(String, Predicate)> {
    let pos = spec
        .find(|c| matches!(c, '=' | '~' | '<' | '>'))
        .with_context(|| format!("condition '{}' has no operator", spec))?;
    let field = spec[..pos].trim();
    if field.is_empty() {
        anyhow::bail!("condition '{}' has no field", spec);
    }

    let rest = &spec[pos..];
    let (op, value) = match rest.get(..2) {
        Some(op @ (">=" | "<=")) => (op, &rest[2..]),
        _ => rest.split_at(1),
    };

    let key_type = cluster
        .filter(|c| c.partition_key == field)
        .map(ClusterConfig::key_type);
    let literal = |raw: &str| -> Result<Value> {
        match key_type {
            Some(key_type) => key_type.parse_literal(raw).with_context(|| {
                format!("'{}' is not a valid {:?} value for '{}'", raw.trim(), key_type, field)
            }),
            None => Ok(parse_value(raw)),
        }
    };

    let predicate = match op {
        "=" if value.contains('|') => Predicate::In(
            value
                .split('|')
                .map(literal)
                .collect::<Result<Vec<_>>>()?,
        ),
        "=" => Predicate::Eq(literal(value)?),
        "~" => Predicate::contains(value.trim()),
        ">" => Predicate::Range {
            lower: Some(RangeBound::exclusive(literal(value)?)),
            upper: None,
        },
        ">=" => Predicate::Range {
            lower: Some(RangeBound::inclusive(literal(value)?)),
            upper: None,
        },
        "<" => Predicate::Range {
            lower: None,
            upper: Some(RangeBound::exclusive(literal(value)?)),
        },
        "<=" => Predicate::Range {
            lower: None,
            upper: Some(RangeBound::inclusive(literal(value)?)),
        },
        other => anyhow::bail!("unsupported operator '{}' in '{}'", other, spec),
    };
    Ok((field.to_string(), predicate))
}

/// Parse conditions; two range conditions on one field combine into one range
pub fn parse_conditions(specs: &[String], cluster: Option<&ClusterConfig>) -> Result<Conditions> {
    let mut conditions = Conditions::new();
    for spec in specs {
        let (field, predicate) = parse_condition(spec, cluster)?;
        let merged = match (conditions.remove(&field), predicate) {
            (None, predicate) => predicate,
            (
                Some(Predicate::Range { lower: l1, upper: u1 }),
                Predicate::Range { lower: l2, upper: u2 },
            ) if l1.is_none() != l2.is_none() && u1.is_none() != u2.is_none() => {
                Predicate::Range {
                    lower: l1.or(l2),
                    upper: u1.or(u2),
                }
            }
            _ => anyhow::bail!("conflicting conditions on field '{}'", field),
        };
        conditions.insert(field, merged);
    }
    Ok(conditions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::{ClusterConfig, SortOptions};

    fn specs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_condition_operators() {
        let conditions =
            parse_conditions(&specs(&["tenant_id=t1", "status=a|b", "name~Ali", "score>=10"]), None)
                .unwrap();

        assert_eq!(conditions["tenant_id"], Predicate::eq("t1"));
        assert_eq!(
            conditions["status"],
            Predicate::In(vec![Value::from("a"), Value::from("b")])
        );
        assert_eq!(conditions["name"], Predicate::contains("Ali"));
        assert_eq!(
            conditions["score"],
            Predicate::Range {
                lower: Some(RangeBound::inclusive(10)),
                upper: None
            }
        );
    }

    #[test]
    fn test_range_conditions_merge() {
        let conditions = parse_conditions(&specs(&["created_at>100", "created_at<=200"]), None).unwrap();
        assert_eq!(
            conditions["created_at"],
            Predicate::Range {
                lower: Some(RangeBound::exclusive(100)),
                upper: Some(RangeBound::inclusive(200)),
            }
        );
        assert!(parse_conditions(&specs(&["a=1", "a=2"]), None).is_err());
        assert!(parse_conditions(&specs(&["a>1", "a>2"]), None).is_err());
    }

    #[test]
    fn test_parse_condition_errors() {
        assert!(parse_conditions(&specs(&["tenant_id"]), None).is_err());
        assert!(parse_conditions(&specs(&["=t1"]), None).is_err());
    }

    #[test]
    fn test_partition_key_literals_follow_key_type() {
        let text_key = ClusterConfig::new("analytics", "tenant_id", "tenant_id");
        let conditions =
            parse_conditions(&specs(&["tenant_id=1", "score=1"]), Some(&text_key)).unwrap();
        assert_eq!(conditions["tenant_id"], Predicate::eq("1"));
        assert_eq!(conditions["score"], Predicate::eq(1));

        let in_list = parse_conditions(&specs(&["tenant_id=1|2"]), Some(&text_key)).unwrap();
        assert_eq!(
            in_list["tenant_id"],
            Predicate::In(vec![Value::from("1"), Value::from("2")])
        );

        let int_key = ClusterConfig::new("analytics", "account_id", "account_id")
            .with_partition_key_type(query_core::KeyType::Integer);
        let conditions = parse_conditions(&specs(&["account_id>=10"]), Some(&int_key)).unwrap();
        assert_eq!(
            conditions["account_id"],
            Predicate::Range {
                lower: Some(RangeBound::inclusive(10)),
                upper: None
            }
        );
        let err = parse_conditions(&specs(&["account_id=acme"]), Some(&int_key)).unwrap_err();
        assert!(err.to_string().contains("account_id"));
    }

    #[test]
    fn test_numeric_tenant_routes_like_text_key() {
        use query_distributed::{ClusterTopology, PartitionPruner, PruningDecision};

        let config = LayerConfig::new(
            ClusterConfig::new("analytics", "tenant_id", "tenant_id"),
            (1..=4).map(|s| NodeInfo::new(format!("ch-{s}"), 9000, "events", s)).collect(),
        );
        let topology = ClusterTopology::from_config(&config).unwrap();
        let pruner = PartitionPruner::new(&topology);

        let conditions = parse_conditions(&specs(&["tenant_id=1"]), Some(&config.cluster)).unwrap();
        let owner = pruner.hash_shard(&Value::from("1")).unwrap();
        assert_eq!(pruner.prune(&conditions), PruningDecision::Shards(vec![owner]));
    }

    #[test]
    fn test_parse_value_types() {
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value(" 42 "), Value::Int(42));
        assert_eq!(parse_value("1.5"), Value::Float(1.5));
        assert_eq!(parse_value("NaN"), Value::from("NaN"));
        assert_eq!(parse_value("t1"), Value::from("t1"));
    }

    #[test]
    fn test_optimize_offline() {
        let config = LayerConfig::new(
            ClusterConfig::new("analytics", "tenant_id", "tenant_id"),
            vec![
                NodeInfo::new("ch-1", 9000, "events", 1),
                NodeInfo::new("ch-2", 9000, "events", 2),
            ],
        )
        .with_entity("tenant_data", SortOptions::new(["created_at"]));

        optimize_query(
            &config,
            "tenant_data",
            "events",
            "SELECT * FROM events",
            "created_at:desc",
            &specs(&["tenant_id=t1"]),
            10,
        )
        .unwrap();

        let err = optimize_query(
            &config,
            "tenant_data",
            "events",
            "SELECT * FROM events",
            "status",
            &[],
            10,
        )
        .unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn test_search_snapshot() {
        use chrono::{TimeZone, Utc};
        use query_index::{write_snapshot, NewFile, RawRecord};

        let store = MetadataIndexStore::new();
        store
            .ingest_file(
                NewFile {
                    file_id: "f1".to_string(),
                    tenant_id: "acme".to_string(),
                    source_id: "crm".to_string(),
                    file_path: "/data/acme/f1.parquet".to_string(),
                    directory_path: "/data/acme".to_string(),
                    file_size: 10,
                    created_at: Utc.timestamp_opt(100, 0).unwrap(),
                    schema_hash: "v1".to_string(),
                },
                vec![RawRecord::from_json(serde_json::json!({"name": "Alice", "status": "active"}))],
            )
            .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.parquet");
        write_snapshot(&path, &store.all_records()).unwrap();

        let args = SearchArgs {
            tenant: "acme".to_string(),
            source: None,
            conditions: specs(&["status=active"]),
            sort: String::new(),
            limit: 10,
            output: OutputFormat::Json,
        };
        search_snapshot(&path, &args).unwrap();
        assert!(search_snapshot(&dir.path().join("missing.parquet"), &args).is_err());
    }
}
