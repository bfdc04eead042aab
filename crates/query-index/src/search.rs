//! Cross-file record search over the metadata index store
//!
//! Searches never open data files. Matching rows come back together with
//! per-file locators so callers can fetch the full records afterwards.

use crate::hash::RecordKey;
use crate::store::{MetadataIndexStore, TenantTables};
use crate::types::{DirectorySummary, FileHint, FileMetadata, RecordMetadata};
use chrono::DateTime;
use query_core::{
    Conditions, Predicate, QueryError, RangeBound, Result, SortField, SortOptions, Value,
};
use query_planner::{sanitize_field, validate_sort_fields};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const RECORD_ENTITY: &str = "record";

/// Sort policy used for record searches unless the caller supplies one
pub fn default_record_sort_options() -> SortOptions {
    SortOptions::new([
        "record_id",
        "name",
        "email",
        "status",
        "category",
        "created_at",
        "updated_at",
        "timestamp",
        "row_number",
    ])
    .with_indexed(["status", "category"])
}

/// A cross-file search
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub tenant_id: String,
    pub source_id: Option<String>,
    pub conditions: Conditions,
    /// Empty means `created_at DESC`
    pub sort_fields: Vec<SortField>,
    /// Zero means the configured maximum
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_condition(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.conditions.insert(field.into(), predicate);
        self
    }

    pub fn with_sort(mut self, sort_fields: Vec<SortField>) -> Self {
        self.sort_fields = sort_fields;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Records of a search plus the files that hold them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub records: Vec<RecordMetadata>,
    /// One entry per file, ordered by file id
    pub file_hints: Vec<FileHint>,
    /// Matches before the limit was applied
    pub total_matched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    RecordId,
    Name,
    Email,
    Status,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeField {
    CreatedAt,
    UpdatedAt,
    Timestamp,
}

/// A record field addressable by conditions and sort keys
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordField {
    Text(TextField),
    Tags,
    Time(TimeField),
    RowNumber,
    Custom(String),
}

impl RecordField {
    fn parse(name: &str) -> Result<Self> {
        sanitize_field(name)?;
        let field = match name {
            "record_id" => RecordField::Text(TextField::RecordId),
            "name" => RecordField::Text(TextField::Name),
            "email" => RecordField::Text(TextField::Email),
            "status" => RecordField::Text(TextField::Status),
            "category" => RecordField::Text(TextField::Category),
            "tags" => RecordField::Tags,
            "created_at" => RecordField::Time(TimeField::CreatedAt),
            "updated_at" => RecordField::Time(TimeField::UpdatedAt),
            "timestamp" => RecordField::Time(TimeField::Timestamp),
            "row_number" => RecordField::RowNumber,
            other => match other.strip_prefix("custom.") {
                Some(key) if !key.is_empty() => RecordField::Custom(key.to_string()),
                _ => {
                    return Err(QueryError::InvalidField {
                        field: name.to_string(),
                        entity: RECORD_ENTITY.to_string(),
                    })
                }
            },
        };
        Ok(field)
    }

    /// Scalar value of the field; timestamps as epoch milliseconds
    fn value(&self, record: &RecordMetadata) -> Value {
        let text = |v: &Option<String>| v.clone().map_or(Value::Null, Value::String);
        match self {
            RecordField::Text(TextField::RecordId) => Value::from(record.record_id.as_str()),
            RecordField::Text(TextField::Name) => text(&record.name),
            RecordField::Text(TextField::Email) => text(&record.email),
            RecordField::Text(TextField::Status) => text(&record.status),
            RecordField::Text(TextField::Category) => text(&record.category),
            RecordField::Tags => Value::Null,
            RecordField::Time(TimeField::CreatedAt) => {
                Value::Int(record.created_at.timestamp_millis())
            }
            RecordField::Time(TimeField::UpdatedAt) => {
                Value::Int(record.updated_at.timestamp_millis())
            }
            RecordField::Time(TimeField::Timestamp) => record
                .timestamp
                .map_or(Value::Null, |t| Value::Int(t.timestamp_millis())),
            RecordField::RowNumber => Value::Int(record.row_number as i64),
            RecordField::Custom(key) => record
                .custom_fields
                .get(key)
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

/// Time literals may be RFC 3339 text; compare them as epoch milliseconds
fn time_literal(field: &str, value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Value::Int(t.timestamp_millis()))
            .map_err(|e| QueryError::InvalidPredicate {
                field: field.to_string(),
                reason: format!("invalid timestamp '{}': {}", s, e),
            }),
        Value::Int(_) => Ok(value.clone()),
        other => Err(QueryError::InvalidPredicate {
            field: field.to_string(),
            reason: format!("expected a timestamp, got {}", other),
        }),
    }
}

fn time_bound(field: &str, bound: &Option<RangeBound>) -> Result<Option<RangeBound>> {
    bound
        .as_ref()
        .map(|b| {
            Ok(RangeBound {
                value: time_literal(field, &b.value)?,
                inclusive: b.inclusive,
            })
        })
        .transpose()
}

/// A condition resolved against the record field set
#[derive(Debug, Clone)]
struct CompiledCondition {
    field: RecordField,
    predicate: Predicate,
}

impl CompiledCondition {
    fn compile(name: &str, predicate: &Predicate) -> Result<Self> {
        let field = RecordField::parse(name)?;
        let predicate = match (&field, predicate) {
            (RecordField::Time(_), Predicate::Eq(v)) => Predicate::Eq(time_literal(name, v)?),
            (RecordField::Time(_), Predicate::In(vs)) => Predicate::In(
                vs.iter()
                    .map(|v| time_literal(name, v))
                    .collect::<Result<_>>()?,
            ),
            (RecordField::Time(_), Predicate::Range { lower, upper }) => Predicate::Range {
                lower: time_bound(name, lower)?,
                upper: time_bound(name, upper)?,
            },
            (RecordField::Time(_) | RecordField::RowNumber, Predicate::Contains(_)) => {
                return Err(QueryError::InvalidPredicate {
                    field: name.to_string(),
                    reason: "substring match needs a text field".to_string(),
                })
            }
            (_, other) => other.clone(),
        };
        Ok(Self { field, predicate })
    }

    fn matches(&self, record: &RecordMetadata) -> bool {
        match self.field {
            RecordField::Tags => record
                .tags
                .iter()
                .any(|t| self.predicate.matches(&Value::from(t.as_str()))),
            _ => self.predicate.matches(&self.field.value(record)),
        }
    }

    /// Exact-match keys servable by the status/category hash indexes
    fn index_keys(&self) -> Option<(TextField, Vec<&str>)> {
        let column = match self.field {
            RecordField::Text(f @ (TextField::Status | TextField::Category)) => f,
            _ => return None,
        };
        let keys = match &self.predicate {
            Predicate::Eq(v) => vec![v.as_str()?],
            Predicate::In(vs) => vs.iter().map(Value::as_str).collect::<Option<Vec<_>>>()?,
            _ => return None,
        };
        Some((column, keys))
    }
}

/// Sort keys compiled from validated sort fields
struct RecordOrdering(Vec<(RecordField, bool)>);

impl RecordOrdering {
    fn compile(sort: &[SortField]) -> Result<Self> {
        sort.iter()
            .map(|s| Ok((RecordField::parse(&s.field)?, s.order.is_descending())))
            .collect::<Result<_>>()
            .map(Self)
    }

    /// Nulls sort last in either direction; ties fall back to file and row
    fn compare(&self, a: &RecordMetadata, b: &RecordMetadata) -> Ordering {
        for (field, descending) in &self.0 {
            let (va, vb) = (field.value(a), field.value(b));
            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = va.compare(&vb).unwrap_or(Ordering::Equal);
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        (&a.file_id, a.row_number).cmp(&(&b.file_id, b.row_number))
    }
}

/// Read-side service answering searches from record metadata alone
pub struct CrossFileQueryService {
    store: Arc<MetadataIndexStore>,
    sort_options: SortOptions,
}

impl CrossFileQueryService {
    pub fn new(store: Arc<MetadataIndexStore>, sort_options: SortOptions) -> Self {
        Self {
            store,
            sort_options,
        }
    }

    pub fn store(&self) -> &Arc<MetadataIndexStore> {
        &self.store
    }

    fn effective_limit(&self, limit: usize) -> usize {
        let max = usize::try_from(self.sort_options.max_result_size.max(1)).unwrap_or(usize::MAX);
        if limit == 0 {
            max
        } else {
            limit.min(max)
        }
    }

    /// Records of a tenant matching every condition, with file locators
    pub fn search_records_across_files(&self, request: &SearchRequest) -> Result<SearchResult> {
        let conditions = request
            .conditions
            .iter()
            .map(|(field, predicate)| CompiledCondition::compile(field, predicate))
            .collect::<Result<Vec<_>>>()?;

        let sort = if request.sort_fields.is_empty() {
            vec![SortField::desc("created_at")]
        } else {
            validate_sort_fields(RECORD_ENTITY, &request.sort_fields, &self.sort_options)?
        };
        let ordering = RecordOrdering::compile(&sort)?;
        let limit = self.effective_limit(request.limit);

        let mut matched = self
            .store
            .with_tenant(&request.tenant_id, |tables| {
                collect_matches(tables, request.source_id.as_deref(), &conditions)
            })
            .unwrap_or_default();

        matched.sort_by(|a, b| ordering.compare(a, b));
        let total_matched = matched.len();
        matched.truncate(limit);

        tracing::debug!(
            tenant = %request.tenant_id,
            conditions = conditions.len(),
            matched = total_matched,
            returned = matched.len(),
            "cross-file search"
        );

        Ok(SearchResult {
            file_hints: file_hints(&matched),
            records: matched,
            total_matched,
        })
    }

    /// Newest records of one source by `created_at`
    pub fn get_latest_records(
        &self,
        tenant_id: &str,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<RecordMetadata>> {
        let request = SearchRequest::new(tenant_id)
            .with_source(source_id)
            .with_limit(limit);
        Ok(self.search_records_across_files(&request)?.records)
    }

    /// Directory summaries, most recently updated first
    pub fn get_directory_summaries(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
    ) -> Vec<DirectorySummary> {
        let mut summaries = self.store.directory_summaries(tenant_id, source_id);
        summaries.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.directory_path.cmp(&b.directory_path))
        });
        summaries
    }

    /// File rows, newest first
    pub fn get_file_metadata(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
        limit: usize,
    ) -> Vec<FileMetadata> {
        let mut files = self.store.files(tenant_id, source_id);
        files.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        files.truncate(self.effective_limit(limit));
        files
    }

    pub fn get_file(&self, file_id: &str) -> Option<FileMetadata> {
        self.store.get_file(file_id)
    }
}

fn collect_matches(
    tables: &TenantTables,
    source_id: Option<&str>,
    conditions: &[CompiledCondition],
) -> Vec<RecordMetadata> {
    let accept = |record: &RecordMetadata| {
        source_id.map_or(true, |s| record.source_id == s)
            && conditions.iter().all(|c| c.matches(record))
    };

    match conditions.iter().find_map(CompiledCondition::index_keys) {
        Some((column, keys)) => {
            let index = match column {
                TextField::Status => &tables.status_index,
                _ => &tables.category_index,
            };
            let candidates: BTreeSet<&RecordKey> =
                keys.iter().flat_map(|k| index.lookup(k)).collect();
            candidates
                .into_iter()
                .filter_map(|key| tables.record(key))
                .filter(|&r| accept(r))
                .cloned()
                .collect()
        }
        None => tables
            .all_records()
            .filter(|&r| accept(r))
            .cloned()
            .collect(),
    }
}

fn file_hints(records: &[RecordMetadata]) -> Vec<FileHint> {
    let mut by_file: BTreeMap<&str, FileHint> = BTreeMap::new();
    for record in records {
        by_file
            .entry(&record.file_id)
            .or_insert_with(|| FileHint {
                file_id: record.file_id.clone(),
                file_path: record.file_path.clone(),
                row_numbers: Vec::new(),
            })
            .row_numbers
            .push(record.row_number);
    }
    by_file
        .into_values()
        .map(|mut hint| {
            hint.row_numbers.sort_unstable();
            hint
        })
        .collect()
}
