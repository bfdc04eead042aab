//! Metadata rows kept by the index store

use chrono::{DateTime, TimeZone, Utc};
use query_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Fields every record is flattened onto. Anything else lands in
/// [`CustomFields`].
pub const SEARCHABLE_FIELDS: &[&str] = &[
    "record_id",
    "name",
    "email",
    "status",
    "category",
    "tags",
    "created_at",
    "updated_at",
    "timestamp",
];

/// Extra record fields outside the searchable set, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomFields(BTreeMap<String, Value>);

impl CustomFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON blob form used at the persistence boundary
    pub fn to_json(&self) -> query_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> query_core::Result<Self> {
        if json.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }
}

impl FromIterator<(String, Value)> for CustomFields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-column statistics of one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
}

impl ColumnStats {
    pub(crate) fn observe(&mut self, value: Option<&Value>) {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            self.null_count += 1;
            return;
        };
        let replace_min = match &self.min {
            None => true,
            Some(min) => value.compare(min) == Some(std::cmp::Ordering::Less),
        };
        if replace_min {
            self.min = Some(value.clone());
        }
        let replace_max = match &self.max {
            None => true,
            Some(max) => value.compare(max) == Some(std::cmp::Ordering::Greater),
        };
        if replace_max {
            self.max = Some(value.clone());
        }
    }
}

/// One row per physical columnar file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub file_path: String,
    pub directory_path: String,
    pub file_size: u64,
    pub record_count: u64,
    pub created_at: DateTime<Utc>,
    pub schema_hash: String,
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
    /// Searchable and custom fields present in at least one record
    pub indexed_fields: BTreeSet<String>,
    pub stats: BTreeMap<String, ColumnStats>,
}

/// One row per logical record: the searchable projection of its fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub file_id: String,
    pub file_path: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timestamp: Option<DateTime<Utc>>,
    pub custom_fields: CustomFields,
    /// Position of the record inside its file
    pub row_number: u64,
    pub offset: Option<u64>,
}

impl RecordMetadata {
    /// Event time of the record, falling back to creation time
    pub fn event_time(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(self.created_at)
    }

    /// Names of the searchable and custom fields this record carries
    pub fn present_fields(&self) -> Vec<String> {
        let mut fields = vec![
            "record_id".to_string(),
            "created_at".to_string(),
            "updated_at".to_string(),
        ];
        let optional = [
            ("name", self.name.is_some()),
            ("email", self.email.is_some()),
            ("status", self.status.is_some()),
            ("category", self.category.is_some()),
            ("tags", !self.tags.is_empty()),
            ("timestamp", self.timestamp.is_some()),
        ];
        fields.extend(
            optional
                .iter()
                .filter(|(_, present)| *present)
                .map(|(name, _)| name.to_string()),
        );
        fields.extend(self.custom_fields.keys().map(|k| format!("custom.{}", k)));
        fields
    }
}

/// Per-field presence within a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub present_count: u64,
}

/// Aggregate of all files in one (tenant, source, directory)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub tenant_id: String,
    pub source_id: String,
    pub directory_path: String,
    pub total_files: u64,
    pub total_records: u64,
    pub total_size: u64,
    pub first_record_at: Option<DateTime<Utc>>,
    pub last_record_at: Option<DateTime<Utc>>,
    /// `created_at` of the newest file
    pub last_updated: DateTime<Utc>,
    pub field_summaries: BTreeMap<String, FieldSummary>,
    pub schema_versions: BTreeSet<String>,
    /// Schema hash of the newest file
    pub current_schema: String,
}

/// A physical file handed over by the ingest pipeline. Derived columns of
/// [`FileMetadata`] (record count, time bounds, stats) are computed on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFile {
    pub file_id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub file_path: String,
    pub directory_path: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub schema_hash: String,
}

/// A record as extracted from a file, before flattening
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Byte offset inside the file, when the format has one
    #[serde(default)]
    pub offset: Option<u64>,
}

impl RawRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            fields,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build from a JSON object; anything else yields an empty record
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(fields) => Self::new(fields),
            _ => Self::default(),
        }
    }
}

/// Locator of matching rows inside one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHint {
    pub file_id: String,
    pub file_path: String,
    /// Ascending row numbers
    pub row_numbers: Vec<u64>,
}

/// Parse a timestamp given as RFC 3339 text or epoch milliseconds
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Convert a JSON value to a scalar. Arrays and objects keep their JSON text.
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}
