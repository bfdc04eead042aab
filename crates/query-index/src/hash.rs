//! Hash index over one record column
//!
//! Serves exact-match lookups on low-cardinality columns such as `status`
//! and `category`. Does not support range or substring queries.

use ahash::AHashMap;

/// Identity of a record row: owning file and row number inside it
pub type RecordKey = (String, u64);

/// Hash index mapping a column value to the records that carry it
#[derive(Debug, Default, Clone)]
pub struct HashIndex {
    column: String,
    map: AHashMap<String, Vec<RecordKey>>,
}

impl HashIndex {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            map: AHashMap::new(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn insert(&mut self, key: &str, record: RecordKey) {
        self.map.entry(key.to_string()).or_default().push(record);
    }

    pub fn delete(&mut self, key: &str, record: &RecordKey) {
        if let Some(records) = self.map.get_mut(key) {
            records.retain(|r| r != record);
            if records.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// Records whose column equals `key` exactly
    pub fn lookup(&self, key: &str) -> &[RecordKey] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct indexed values
    pub fn keys(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
