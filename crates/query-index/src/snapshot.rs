//! Parquet snapshot of the record metadata table
//!
//! Tags and custom fields are stored as JSON text columns; timestamps as
//! UTC milliseconds.

use crate::types::{CustomFields, RecordMetadata};
use arrow::array::{Array, ArrayRef, StringArray, TimestampMillisecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use query_core::{QueryError, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

/// Arrow schema of the snapshot file
pub fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("tenant_id", DataType::Utf8, false),
        Field::new("source_id", DataType::Utf8, false),
        Field::new("file_id", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("email", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, true),
        Field::new("category", DataType::Utf8, true),
        Field::new("tags", DataType::Utf8, false),
        Field::new("created_at", timestamp_type(), false),
        Field::new("updated_at", timestamp_type(), false),
        Field::new("timestamp", timestamp_type(), true),
        Field::new("custom_fields", DataType::Utf8, false),
        Field::new("row_number", DataType::UInt64, false),
        Field::new("offset", DataType::UInt64, true),
    ]))
}

fn text_column<'a>(
    records: &'a [RecordMetadata],
    f: impl Fn(&'a RecordMetadata) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(records.iter().map(f).collect::<StringArray>())
}

fn time_column(
    records: &[RecordMetadata],
    f: impl Fn(&RecordMetadata) -> Option<DateTime<Utc>>,
) -> ArrayRef {
    Arc::new(
        records
            .iter()
            .map(|r| f(r).map(|t| t.timestamp_millis()))
            .collect::<TimestampMillisecondArray>()
            .with_timezone("UTC"),
    )
}

/// Convert record rows into one Arrow batch
pub fn records_to_batch(records: &[RecordMetadata]) -> Result<RecordBatch> {
    let tags = records
        .iter()
        .map(|r| serde_json::to_string(&r.tags))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let custom = records
        .iter()
        .map(|r| r.custom_fields.to_json())
        .collect::<Result<Vec<_>>>()?;

    let columns: Vec<ArrayRef> = vec![
        text_column(records, |r| Some(r.record_id.as_str())),
        text_column(records, |r| Some(r.tenant_id.as_str())),
        text_column(records, |r| Some(r.source_id.as_str())),
        text_column(records, |r| Some(r.file_id.as_str())),
        text_column(records, |r| Some(r.file_path.as_str())),
        text_column(records, |r| r.name.as_deref()),
        text_column(records, |r| r.email.as_deref()),
        text_column(records, |r| r.status.as_deref()),
        text_column(records, |r| r.category.as_deref()),
        Arc::new(StringArray::from(tags)),
        time_column(records, |r| Some(r.created_at)),
        time_column(records, |r| Some(r.updated_at)),
        time_column(records, |r| r.timestamp),
        Arc::new(StringArray::from(custom)),
        Arc::new(UInt64Array::from_iter_values(records.iter().map(|r| r.row_number))),
        Arc::new(records.iter().map(|r| r.offset).collect::<UInt64Array>()),
    ];

    Ok(RecordBatch::try_new(record_schema(), columns)?)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            QueryError::SerializationError(format!("snapshot column '{}' missing or mistyped", name))
        })
}

fn optional_text(array: &StringArray, row: usize) -> Option<String> {
    array.is_valid(row).then(|| array.value(row).to_string())
}

fn millis(array: &TimestampMillisecondArray, row: usize) -> Result<Option<DateTime<Utc>>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let ms = array.value(row);
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(Some)
        .ok_or_else(|| QueryError::SerializationError(format!("timestamp {} out of range", ms)))
}

fn required<T>(value: Option<T>, name: &str, row: usize) -> Result<T> {
    value.ok_or_else(|| {
        QueryError::SerializationError(format!("snapshot column '{}' is null at row {}", name, row))
    })
}

/// Convert an Arrow batch of the snapshot schema back into record rows
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<RecordMetadata>> {
    let record_id = column::<StringArray>(batch, "record_id")?;
    let tenant_id = column::<StringArray>(batch, "tenant_id")?;
    let source_id = column::<StringArray>(batch, "source_id")?;
    let file_id = column::<StringArray>(batch, "file_id")?;
    let file_path = column::<StringArray>(batch, "file_path")?;
    let name = column::<StringArray>(batch, "name")?;
    let email = column::<StringArray>(batch, "email")?;
    let status = column::<StringArray>(batch, "status")?;
    let category = column::<StringArray>(batch, "category")?;
    let tags = column::<StringArray>(batch, "tags")?;
    let created_at = column::<TimestampMillisecondArray>(batch, "created_at")?;
    let updated_at = column::<TimestampMillisecondArray>(batch, "updated_at")?;
    let timestamp = column::<TimestampMillisecondArray>(batch, "timestamp")?;
    let custom = column::<StringArray>(batch, "custom_fields")?;
    let row_number = column::<UInt64Array>(batch, "row_number")?;
    let offset = column::<UInt64Array>(batch, "offset")?;

    (0..batch.num_rows())
        .map(|row| {
            Ok(RecordMetadata {
                record_id: record_id.value(row).to_string(),
                tenant_id: tenant_id.value(row).to_string(),
                source_id: source_id.value(row).to_string(),
                file_id: file_id.value(row).to_string(),
                file_path: file_path.value(row).to_string(),
                name: optional_text(name, row),
                email: optional_text(email, row),
                status: optional_text(status, row),
                category: optional_text(category, row),
                tags: serde_json::from_str::<BTreeSet<String>>(tags.value(row))?,
                created_at: required(millis(created_at, row)?, "created_at", row)?,
                updated_at: required(millis(updated_at, row)?, "updated_at", row)?,
                timestamp: millis(timestamp, row)?,
                custom_fields: CustomFields::from_json(custom.value(row))?,
                row_number: row_number.value(row),
                offset: offset.is_valid(row).then(|| offset.value(row)),
            })
        })
        .collect()
}

/// Write record rows to a Parquet file; returns the number of rows written
pub fn write_snapshot(path: &Path, records: &[RecordMetadata]) -> Result<usize> {
    let batch = records_to_batch(records)?;
    let file = File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    tracing::info!(path = %path.display(), records = records.len(), "wrote metadata snapshot");
    Ok(records.len())
}

/// Read every record row from a Parquet snapshot
pub fn read_snapshot(path: &Path) -> Result<Vec<RecordMetadata>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        records.extend(batch_to_records(&batch?)?);
    }

    tracing::debug!(path = %path.display(), records = records.len(), "read metadata snapshot");
    Ok(records)
}
