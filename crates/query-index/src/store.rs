//! Metadata index store
//!
//! Holds the three metadata tables per tenant: one row per file, one row per
//! record and one summary per (source, directory). Records are searchable
//! without opening the files they came from.

use crate::hash::{HashIndex, RecordKey};
use crate::types::{
    json_to_value, parse_timestamp, ColumnStats, CustomFields, DirectorySummary, FileMetadata,
    NewFile, RawRecord, RecordMetadata,
};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use query_core::{QueryError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

type DirectoryKey = (String, String);

/// Summary of one directory plus what incremental updates need
#[derive(Debug)]
pub(crate) struct DirectoryEntry {
    pub(crate) summary: DirectorySummary,
    files: BTreeSet<String>,
    /// (created_at, file_id) of the newest file
    newest: (DateTime<Utc>, String),
}

impl DirectoryEntry {
    fn empty(tenant_id: &str, key: &DirectoryKey, file: &FileMetadata) -> Self {
        Self {
            summary: DirectorySummary {
                tenant_id: tenant_id.to_string(),
                source_id: key.0.clone(),
                directory_path: key.1.clone(),
                total_files: 0,
                total_records: 0,
                total_size: 0,
                first_record_at: None,
                last_record_at: None,
                last_updated: file.created_at,
                field_summaries: BTreeMap::new(),
                schema_versions: BTreeSet::new(),
                current_schema: file.schema_hash.clone(),
            },
            files: BTreeSet::new(),
            newest: (file.created_at, file.file_id.clone()),
        }
    }

    /// Fold one more file into the summary
    fn add_file<'a>(
        &mut self,
        file: &FileMetadata,
        records: impl IntoIterator<Item = &'a RecordMetadata>,
    ) {
        let summary = &mut self.summary;
        summary.total_files += 1;
        summary.total_records += file.record_count;
        summary.total_size += file.file_size;
        summary.first_record_at = min_time(summary.first_record_at, file.min_timestamp);
        summary.last_record_at = summary.last_record_at.max(file.max_timestamp);
        summary.schema_versions.insert(file.schema_hash.clone());
        for record in records {
            for field in record.present_fields() {
                summary.field_summaries.entry(field).or_default().present_count += 1;
            }
        }

        let candidate = (file.created_at, file.file_id.clone());
        if self.files.is_empty() || candidate > self.newest {
            summary.last_updated = file.created_at;
            summary.current_schema = file.schema_hash.clone();
            self.newest = candidate;
        }
        self.files.insert(file.file_id.clone());
    }
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Metadata tables of one tenant
#[derive(Debug)]
pub(crate) struct TenantTables {
    pub(crate) files: AHashMap<String, FileMetadata>,
    /// file id -> row number -> record
    pub(crate) records: AHashMap<String, BTreeMap<u64, RecordMetadata>>,
    pub(crate) directories: AHashMap<DirectoryKey, DirectoryEntry>,
    pub(crate) status_index: HashIndex,
    pub(crate) category_index: HashIndex,
}

impl TenantTables {
    fn new() -> Self {
        Self {
            files: AHashMap::new(),
            records: AHashMap::new(),
            directories: AHashMap::new(),
            status_index: HashIndex::new("status"),
            category_index: HashIndex::new("category"),
        }
    }

    pub(crate) fn record(&self, key: &RecordKey) -> Option<&RecordMetadata> {
        self.records.get(&key.0).and_then(|rows| rows.get(&key.1))
    }

    /// Every record row of the tenant
    pub(crate) fn all_records(&self) -> impl Iterator<Item = &RecordMetadata> {
        self.records.values().flat_map(BTreeMap::values)
    }

    fn insert_file(&mut self, tenant_id: &str, file: FileMetadata, records: Vec<RecordMetadata>) {
        for record in &records {
            let key = (record.file_id.clone(), record.row_number);
            if let Some(status) = &record.status {
                self.status_index.insert(status, key.clone());
            }
            if let Some(category) = &record.category {
                self.category_index.insert(category, key);
            }
        }

        let dir_key = (file.source_id.clone(), file.directory_path.clone());
        self.directories
            .entry(dir_key.clone())
            .or_insert_with(|| DirectoryEntry::empty(tenant_id, &dir_key, &file))
            .add_file(&file, &records);

        let rows = records.into_iter().map(|r| (r.row_number, r)).collect();
        self.records.insert(file.file_id.clone(), rows);
        self.files.insert(file.file_id.clone(), file);
    }

    /// Remove a file and its records; returns the removed file row
    fn remove_file(&mut self, file_id: &str) -> Option<FileMetadata> {
        let file = self.files.remove(file_id)?;
        for record in self.records.remove(file_id).unwrap_or_default().into_values() {
            let key = (record.file_id.clone(), record.row_number);
            if let Some(status) = &record.status {
                self.status_index.delete(status, &key);
            }
            if let Some(category) = &record.category {
                self.category_index.delete(category, &key);
            }
        }
        Some(file)
    }

    /// Rebuild the summary of one directory from the files still in it
    fn recompute_directory(&mut self, tenant_id: &str, key: &DirectoryKey) {
        let Some(entry) = self.directories.remove(key) else {
            return;
        };

        let mut rebuilt: Option<DirectoryEntry> = None;
        for file_id in &entry.files {
            let Some(file) = self.files.get(file_id) else {
                continue;
            };
            let records = self.records.get(file_id).into_iter().flat_map(BTreeMap::values);
            rebuilt
                .get_or_insert_with(|| DirectoryEntry::empty(tenant_id, key, file))
                .add_file(file, records);
        }
        if let Some(rebuilt) = rebuilt {
            self.directories.insert(key.clone(), rebuilt);
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    tenants: AHashMap<String, TenantTables>,
    /// file id -> owning tenant
    file_owner: AHashMap<String, String>,
}

impl StoreInner {
    /// Drop an existing file row wherever it lives and fix its directory
    fn evict(&mut self, file_id: &str) {
        let Some(tenant_id) = self.file_owner.remove(file_id) else {
            return;
        };
        if let Some(tables) = self.tenants.get_mut(&tenant_id) {
            if let Some(old) = tables.remove_file(file_id) {
                tracing::debug!(file_id, tenant = %tenant_id, "replacing previously ingested file");
                tables.recompute_directory(&tenant_id, &(old.source_id, old.directory_path));
            }
        }
    }

    fn insert(&mut self, file: FileMetadata, records: Vec<RecordMetadata>) {
        let tenant_id = file.tenant_id.clone();
        self.file_owner.insert(file.file_id.clone(), tenant_id.clone());

        self.tenants
            .entry(tenant_id.clone())
            .or_insert_with(TenantTables::new)
            .insert_file(&tenant_id, file, records);
    }
}

/// In-memory metadata index store
#[derive(Debug, Default)]
pub struct MetadataIndexStore {
    inner: RwLock<StoreInner>,
}

impl MetadataIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one written file and its records. Re-ingesting a file id
    /// replaces the file row and every record row of the previous version.
    pub fn ingest_file(&self, file: NewFile, records: Vec<RawRecord>) -> Result<FileMetadata> {
        if file.file_id.is_empty() || file.tenant_id.is_empty() {
            return Err(QueryError::ConfigError(
                "file id and tenant id are required for ingest".to_string(),
            ));
        }

        let records: Vec<RecordMetadata> = records
            .into_iter()
            .enumerate()
            .map(|(row, raw)| flatten_record(&file, row as u64, raw))
            .collect();
        let metadata = build_file_metadata(file, &records);

        let mut inner = self.inner.write();
        inner.evict(&metadata.file_id);
        inner.insert(metadata.clone(), records);

        tracing::info!(
            file_id = %metadata.file_id,
            tenant = %metadata.tenant_id,
            records = metadata.record_count,
            "ingested file metadata"
        );
        Ok(metadata)
    }

    /// Load record rows, e.g. from a snapshot. File rows are rebuilt from the
    /// records: size and schema hash are unknown and left empty.
    pub fn restore_records(&self, records: Vec<RecordMetadata>) -> usize {
        let mut by_file: BTreeMap<String, Vec<RecordMetadata>> = BTreeMap::new();
        for record in records {
            by_file.entry(record.file_id.clone()).or_default().push(record);
        }

        let mut inner = self.inner.write();
        let mut restored = 0;
        for (file_id, mut rows) in by_file {
            rows.sort_by_key(|r| r.row_number);
            let Some(first) = rows.first() else {
                continue;
            };
            let file = NewFile {
                file_id: file_id.clone(),
                tenant_id: first.tenant_id.clone(),
                source_id: first.source_id.clone(),
                file_path: first.file_path.clone(),
                directory_path: parent_directory(&first.file_path),
                file_size: 0,
                created_at: rows.iter().map(|r| r.created_at).min().unwrap_or(first.created_at),
                schema_hash: String::new(),
            };
            let metadata = build_file_metadata(file, &rows);
            restored += rows.len();
            inner.evict(&file_id);
            inner.insert(metadata, rows);
        }

        tracing::info!(records = restored, "restored record metadata");
        restored
    }

    /// File row by id
    pub fn get_file(&self, file_id: &str) -> Option<FileMetadata> {
        let inner = self.inner.read();
        let tenant = inner.file_owner.get(file_id)?;
        inner.tenants.get(tenant)?.files.get(file_id).cloned()
    }

    /// File rows of a tenant, optionally restricted to one source
    pub fn files(&self, tenant_id: &str, source_id: Option<&str>) -> Vec<FileMetadata> {
        self.with_tenant(tenant_id, |tables| {
            tables
                .files
                .values()
                .filter(|f| source_id.map_or(true, |s| f.source_id == s))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Directory summaries of a tenant, optionally restricted to one source
    pub fn directory_summaries(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
    ) -> Vec<DirectorySummary> {
        self.with_tenant(tenant_id, |tables| {
            tables
                .directories
                .values()
                .map(|d| &d.summary)
                .filter(|d| source_id.map_or(true, |s| d.source_id == s))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Every record row, ordered by tenant, file and row number
    pub fn all_records(&self) -> Vec<RecordMetadata> {
        let inner = self.inner.read();
        let mut records: Vec<RecordMetadata> = inner
            .tenants
            .values()
            .flat_map(|t| t.all_records().cloned())
            .collect();
        records.sort_by(|a, b| {
            (&a.tenant_id, &a.file_id, a.row_number).cmp(&(&b.tenant_id, &b.file_id, b.row_number))
        });
        records
    }

    pub fn file_count(&self) -> usize {
        self.inner.read().file_owner.len()
    }

    pub fn record_count(&self) -> usize {
        self.inner
            .read()
            .tenants
            .values()
            .map(|t| t.records.values().map(BTreeMap::len).sum::<usize>())
            .sum()
    }

    /// Run `f` against a tenant's tables under the read lock
    pub(crate) fn with_tenant<R>(
        &self,
        tenant_id: &str,
        f: impl FnOnce(&TenantTables) -> R,
    ) -> Option<R> {
        let inner = self.inner.read();
        inner.tenants.get(tenant_id).map(f)
    }
}

fn parent_directory(file_path: &str) -> String {
    Path::new(file_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn tags(value: &serde_json::Value) -> BTreeSet<String> {
    match value {
        serde_json::Value::Array(items) => items.iter().filter_map(text).collect(),
        serde_json::Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Flatten a raw record onto the searchable field set. Unparseable
/// timestamps are kept as custom fields.
fn flatten_record(file: &NewFile, row_number: u64, raw: RawRecord) -> RecordMetadata {
    let mut custom = CustomFields::new();
    let mut record_id = None;
    let mut id = None;
    let mut name = None;
    let mut email = None;
    let mut status = None;
    let mut category = None;
    let mut tag_set = BTreeSet::new();
    let mut created_at = None;
    let mut updated_at = None;
    let mut timestamp = None;

    for (key, value) in raw.fields {
        let slot: &mut Option<DateTime<Utc>> = match key.as_str() {
            "record_id" => {
                record_id = text(&value);
                continue;
            }
            "id" => {
                id = text(&value);
                continue;
            }
            "name" => {
                name = text(&value);
                continue;
            }
            "email" => {
                email = text(&value);
                continue;
            }
            "status" => {
                status = text(&value);
                continue;
            }
            "category" => {
                category = text(&value);
                continue;
            }
            "tags" => {
                tag_set = tags(&value);
                continue;
            }
            "created_at" => &mut created_at,
            "updated_at" => &mut updated_at,
            "timestamp" => &mut timestamp,
            _ => {
                custom.insert(key, json_to_value(&value));
                continue;
            }
        };
        match parse_timestamp(&value) {
            Some(ts) => *slot = Some(ts),
            None if value.is_null() => {}
            None => {
                tracing::debug!(field = %key, file_id = %file.file_id, row_number, "unparseable timestamp kept as custom field");
                custom.insert(key, json_to_value(&value));
            }
        }
    }

    let created_at = created_at.unwrap_or(file.created_at);
    RecordMetadata {
        record_id: record_id
            .or(id)
            .unwrap_or_else(|| format!("{}:{}", file.file_id, row_number)),
        tenant_id: file.tenant_id.clone(),
        source_id: file.source_id.clone(),
        file_id: file.file_id.clone(),
        file_path: file.file_path.clone(),
        name,
        email,
        status,
        category,
        tags: tag_set,
        created_at,
        updated_at: updated_at.unwrap_or(created_at),
        timestamp,
        custom_fields: custom,
        row_number,
        offset: raw.offset,
    }
}

fn build_file_metadata(file: NewFile, records: &[RecordMetadata]) -> FileMetadata {
    let mut indexed_fields = BTreeSet::new();
    for record in records {
        indexed_fields.extend(record.present_fields());
    }

    let custom_keys: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.custom_fields.keys())
        .collect();

    let mut stats: BTreeMap<String, ColumnStats> = BTreeMap::new();
    for record in records {
        let fixed = [
            ("name", &record.name),
            ("email", &record.email),
            ("status", &record.status),
            ("category", &record.category),
        ];
        for (field, value) in fixed {
            let value = value.as_deref().map(query_core::Value::from);
            stats.entry(field.to_string()).or_default().observe(value.as_ref());
        }
        for key in &custom_keys {
            stats
                .entry(format!("custom.{}", key))
                .or_default()
                .observe(record.custom_fields.get(key));
        }
    }

    FileMetadata {
        file_id: file.file_id,
        tenant_id: file.tenant_id,
        source_id: file.source_id,
        file_path: file.file_path,
        directory_path: file.directory_path,
        file_size: file.file_size,
        record_count: records.len() as u64,
        created_at: file.created_at,
        schema_hash: file.schema_hash,
        min_timestamp: records.iter().map(RecordMetadata::event_time).min(),
        max_timestamp: records.iter().map(RecordMetadata::event_time).max(),
        indexed_fields,
        stats,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use query_core::Value;
    use serde_json::json;

    pub(crate) fn new_file(id: &str, tenant: &str, dir: &str, created: i64) -> NewFile {
        NewFile {
            file_id: id.to_string(),
            tenant_id: tenant.to_string(),
            source_id: "crm".to_string(),
            file_path: format!("{}/{}.parquet", dir, id),
            directory_path: dir.to_string(),
            file_size: 1024,
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            schema_hash: format!("schema-{}", created),
        }
    }

    pub(crate) fn raw(value: serde_json::Value) -> RawRecord {
        RawRecord::from_json(value)
    }

    #[test]
    fn test_flatten_record() {
        let file = new_file("f1", "acme", "/data/acme/2024", 1_700_000_000);
        let record = flatten_record(
            &file,
            3,
            raw(json!({
                "id": "r-1",
                "name": "Ada Lovelace",
                "status": "active",
                "tags": ["vip", "beta"],
                "timestamp": "2024-01-02T03:04:05Z",
                "region": "eu-west",
                "score": 7,
                "updated_at": "last week"
            }))
            .with_offset(512),
        );

        assert_eq!(record.record_id, "r-1");
        assert_eq!(record.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(record.tags.len(), 2);
        assert_eq!(record.created_at, file.created_at);
        assert_eq!(record.updated_at, file.created_at);
        assert_eq!(
            record.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(record.custom_fields.get("region"), Some(&Value::from("eu-west")));
        assert_eq!(record.custom_fields.get("score"), Some(&Value::Int(7)));
        assert_eq!(record.custom_fields.get("updated_at"), Some(&Value::from("last week")));
        assert_eq!(record.row_number, 3);
        assert_eq!(record.offset, Some(512));
    }

    #[test]
    fn test_record_id_preference() {
        let file = new_file("f1", "acme", "/d", 0);
        let explicit = flatten_record(&file, 0, raw(json!({"id": "a", "record_id": "b"})));
        assert_eq!(explicit.record_id, "b");
        let generated = flatten_record(&file, 4, raw(json!({"name": "x"})));
        assert_eq!(generated.record_id, "f1:4");
    }

    #[test]
    fn test_ingest_builds_file_row() {
        let store = MetadataIndexStore::new();
        let file = store
            .ingest_file(
                new_file("f1", "acme", "/data/acme", 1_700_000_000),
                vec![
                    raw(json!({"name": "a", "status": "active", "timestamp": 1_000})),
                    raw(json!({"name": "b", "plan": "pro", "timestamp": 5_000})),
                ],
            )
            .unwrap();

        assert_eq!(file.record_count, 2);
        assert_eq!(file.min_timestamp, Utc.timestamp_millis_opt(1_000).single());
        assert_eq!(file.max_timestamp, Utc.timestamp_millis_opt(5_000).single());
        assert!(file.indexed_fields.contains("status"));
        assert!(file.indexed_fields.contains("custom.plan"));
        assert_eq!(file.stats["status"].null_count, 1);
        assert_eq!(file.stats["custom.plan"].max, Some(Value::from("pro")));
        assert_eq!(store.get_file("f1"), Some(file));
    }

    #[test]
    fn test_reingest_replaces_file_and_records() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(
                new_file("f1", "acme", "/data", 100),
                vec![raw(json!({"status": "open"})), raw(json!({"status": "open"}))],
            )
            .unwrap();
        store
            .ingest_file(
                new_file("f1", "acme", "/data", 200),
                vec![raw(json!({"status": "closed"}))],
            )
            .unwrap();

        assert_eq!(store.file_count(), 1);
        assert_eq!(store.record_count(), 1);
        store
            .with_tenant("acme", |t| {
                assert!(t.status_index.lookup("open").is_empty());
                assert_eq!(t.status_index.lookup("closed").len(), 1);
            })
            .unwrap();

        let summaries = store.directory_summaries("acme", None);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total_records, 1);
        assert_eq!(summaries[0].current_schema, "schema-200");
    }

    #[test]
    fn test_directory_summary_recomputed_over_all_files() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(
                new_file("f1", "acme", "/data/a", 100),
                vec![raw(json!({"name": "x", "timestamp": 10_000}))],
            )
            .unwrap();
        store
            .ingest_file(
                new_file("f2", "acme", "/data/a", 300),
                vec![
                    raw(json!({"name": "y", "email": "y@example.com", "timestamp": 2_000})),
                    raw(json!({"timestamp": 50_000})),
                ],
            )
            .unwrap();
        store
            .ingest_file(new_file("f3", "acme", "/data/b", 200), vec![raw(json!({}))])
            .unwrap();

        let summaries = store.directory_summaries("acme", Some("crm"));
        let a = summaries
            .iter()
            .find(|s| s.directory_path == "/data/a")
            .unwrap();
        assert_eq!(a.total_files, 2);
        assert_eq!(a.total_records, 3);
        assert_eq!(a.total_size, 2048);
        assert_eq!(a.first_record_at, Utc.timestamp_millis_opt(2_000).single());
        assert_eq!(a.last_record_at, Utc.timestamp_millis_opt(50_000).single());
        assert_eq!(a.last_updated, Utc.timestamp_opt(300, 0).unwrap());
        assert_eq!(a.current_schema, "schema-300");
        assert_eq!(a.schema_versions.len(), 2);
        assert_eq!(a.field_summaries["name"].present_count, 2);
        assert_eq!(a.field_summaries["email"].present_count, 1);
        assert_eq!(a.field_summaries["record_id"].present_count, 3);

        assert!(store.directory_summaries("acme", Some("billing")).is_empty());
        assert!(store.directory_summaries("globex", None).is_empty());
    }

    #[test]
    fn test_directory_summary_after_replacing_newest_file() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(
                new_file("f1", "acme", "/data/a", 100),
                vec![raw(json!({"name": "x", "timestamp": 1_000}))],
            )
            .unwrap();
        store
            .ingest_file(
                new_file("f2", "acme", "/data/a", 300),
                vec![raw(json!({"email": "y@example.com", "timestamp": 9_000}))],
            )
            .unwrap();

        // f2 moves to another directory; /data/a falls back to f1 alone
        store
            .ingest_file(new_file("f2", "acme", "/data/b", 300), vec![raw(json!({}))])
            .unwrap();

        let summaries = store.directory_summaries("acme", None);
        let a = summaries
            .iter()
            .find(|s| s.directory_path == "/data/a")
            .unwrap();
        assert_eq!(a.total_files, 1);
        assert_eq!(a.total_records, 1);
        assert_eq!(a.last_record_at, Utc.timestamp_millis_opt(1_000).single());
        assert_eq!(a.last_updated, Utc.timestamp_opt(100, 0).unwrap());
        assert_eq!(a.current_schema, "schema-100");
        assert!(!a.field_summaries.contains_key("email"));

        let b = summaries
            .iter()
            .find(|s| s.directory_path == "/data/b")
            .unwrap();
        assert_eq!(b.total_files, 1);
        assert_eq!(b.current_schema, "schema-300");
    }

    #[test]
    fn test_directory_removed_with_last_file() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(new_file("f1", "acme", "/data/a", 100), vec![raw(json!({}))])
            .unwrap();
        store
            .ingest_file(new_file("f1", "acme", "/data/b", 100), vec![raw(json!({}))])
            .unwrap();

        let dirs: Vec<String> = store
            .directory_summaries("acme", None)
            .into_iter()
            .map(|s| s.directory_path)
            .collect();
        assert_eq!(dirs, vec!["/data/b".to_string()]);
    }

    #[test]
    fn test_record_lookup_by_row_number() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(
                new_file("f1", "acme", "/d", 1),
                vec![raw(json!({"id": "a"})), raw(json!({"id": "b"})), raw(json!({"id": "c"}))],
            )
            .unwrap();

        store
            .with_tenant("acme", |t| {
                let key = ("f1".to_string(), 2);
                assert_eq!(t.record(&key).map(|r| r.record_id.as_str()), Some("c"));
                assert!(t.record(&("f1".to_string(), 3)).is_none());
                assert!(t.record(&("f9".to_string(), 0)).is_none());
            })
            .unwrap();
    }

    #[test]
    fn test_older_file_keeps_current_schema() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(new_file("f2", "acme", "/d", 300), vec![raw(json!({}))])
            .unwrap();
        store
            .ingest_file(new_file("f1", "acme", "/d", 100), vec![raw(json!({}))])
            .unwrap();

        let summary = &store.directory_summaries("acme", None)[0];
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.current_schema, "schema-300");
        assert_eq!(summary.last_updated, Utc.timestamp_opt(300, 0).unwrap());
    }

    #[test]
    fn test_tenants_are_isolated() {
        let store = MetadataIndexStore::new();
        store
            .ingest_file(new_file("f1", "acme", "/d", 1), vec![raw(json!({"status": "open"}))])
            .unwrap();
        store
            .ingest_file(new_file("f2", "globex", "/d", 1), vec![raw(json!({"status": "open"}))])
            .unwrap();

        assert_eq!(store.files("acme", None).len(), 1);
        let open = store
            .with_tenant("globex", |t| t.status_index.lookup("open").to_vec())
            .unwrap();
        assert_eq!(open, vec![("f2".to_string(), 0)]);
    }

    #[test]
    fn test_restore_records() {
        let source = MetadataIndexStore::new();
        source
            .ingest_file(
                new_file("f1", "acme", "/data/acme", 100),
                vec![raw(json!({"status": "open"})), raw(json!({"category": "billing"}))],
            )
            .unwrap();

        let restored = MetadataIndexStore::new();
        assert_eq!(restored.restore_records(source.all_records()), 2);
        let file = restored.get_file("f1").unwrap();
        assert_eq!(file.directory_path, "/data/acme");
        assert_eq!(file.record_count, 2);
        assert_eq!(restored.all_records(), source.all_records());
    }

    #[test]
    fn test_ingest_requires_ids() {
        let store = MetadataIndexStore::new();
        let mut file = new_file("", "acme", "/d", 0);
        assert!(store.ingest_file(file.clone(), Vec::new()).is_err());
        file.file_id = "f1".to_string();
        file.tenant_id = String::new();
        assert!(store.ingest_file(file, Vec::new()).is_err());
    }
}
