//! Keyset pagination for streaming execution
//!
//! A streaming query is read in chunks. Each follow-up chunk restarts after
//! the last sort-key values seen, never at a numeric offset. Every chunk is an
//! independent statement (read-committed per chunk): rows committed ahead of
//! the cursor show up in later chunks, rows committed behind it are not
//! revisited. With a unique trailing sort key no row is returned twice.

use crate::sql::{render_literal, sanitize_field};
use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, StringArray, TimestampMillisecondArray, UInt16Array,
    UInt32Array, UInt64Array, UInt8Array,
};
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result, SortField, Value};
use serde::{Deserialize, Serialize};

/// Last-seen sort key values, one per sort field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysetCursor {
    pub values: Vec<Value>,
}

impl KeysetCursor {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Build the cursor from the last row of a chunk.
    /// Returns `None` for an empty batch.
    pub fn from_last_row(batch: &RecordBatch, sort: &[SortField]) -> Result<Option<Self>> {
        if batch.num_rows() == 0 {
            return Ok(None);
        }
        let row = batch.num_rows() - 1;
        let values = sort
            .iter()
            .map(|s| {
                let column = batch.column_by_name(&s.field).ok_or_else(|| {
                    QueryError::PlanningError(format!(
                        "sort column '{}' missing from chunk",
                        s.field
                    ))
                })?;
                array_value(column.as_ref(), row, &s.field)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self { values }))
    }

    /// Render the "strictly after this position" predicate:
    /// `(a > x OR a IS NULL) OR (a = x AND (b < y OR b IS NULL))`, with `<`
    /// for descending keys. NULLs sort last in both directions, so nothing
    /// follows a NULL on its own key and equality against NULL is `IS NULL`.
    pub fn render_predicate(&self, sort: &[SortField]) -> Result<String> {
        if sort.is_empty() {
            return Err(QueryError::PlanningError(
                "keyset pagination requires at least one sort field".to_string(),
            ));
        }
        if self.values.len() != sort.len() {
            return Err(QueryError::PlanningError(format!(
                "cursor has {} values for {} sort fields",
                self.values.len(),
                sort.len()
            )));
        }

        let mut disjuncts = Vec::with_capacity(sort.len());
        for depth in 0..sort.len() {
            let value = &self.values[depth];
            if value.is_null() {
                continue;
            }
            let mut terms = Vec::with_capacity(depth + 1);
            for (prefix, prefix_value) in sort[..depth].iter().zip(&self.values) {
                let field = sanitize_field(&prefix.field)?;
                terms.push(match prefix_value {
                    Value::Null => format!("{} IS NULL", field),
                    v => format!("{} = {}", field, render_literal(v)?),
                });
            }
            let key = &sort[depth];
            let field = sanitize_field(&key.field)?;
            let op = if key.order.is_descending() { "<" } else { ">" };
            terms.push(format!(
                "({} {} {} OR {} IS NULL)",
                field,
                op,
                render_literal(value)?,
                field
            ));
            if terms.len() == 1 {
                disjuncts.append(&mut terms);
            } else {
                disjuncts.push(format!("({})", terms.join(" AND ")));
            }
        }

        if disjuncts.is_empty() {
            // every key is NULL: no position follows the cursor
            return Ok("1 = 0".to_string());
        }
        Ok(disjuncts.join(" OR "))
    }
}

fn array_value(array: &dyn Array, row: usize, field: &str) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    macro_rules! int_value {
        ($ty:ty) => {
            if let Some(arr) = array.as_any().downcast_ref::<$ty>() {
                return Ok(Value::Int(arr.value(row) as i64));
            }
        };
    }
    int_value!(Int64Array);
    int_value!(Int32Array);
    int_value!(Int16Array);
    int_value!(Int8Array);
    int_value!(UInt32Array);
    int_value!(UInt16Array);
    int_value!(UInt8Array);
    int_value!(TimestampMillisecondArray);

    if let Some(arr) = array.as_any().downcast_ref::<UInt64Array>() {
        let v = i64::try_from(arr.value(row)).map_err(|_| {
            QueryError::PlanningError(format!("cursor value of '{}' overflows i64", field))
        })?;
        return Ok(Value::Int(v));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok(Value::Float(arr.value(row)));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Float32Array>() {
        return Ok(Value::Float(arr.value(row) as f64));
    }
    if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        return Ok(Value::String(arr.value(row).to_string()));
    }
    if let Some(arr) = array.as_any().downcast_ref::<LargeStringArray>() {
        return Ok(Value::String(arr.value(row).to_string()));
    }
    if let Some(arr) = array.as_any().downcast_ref::<BooleanArray>() {
        return Ok(Value::Bool(arr.value(row)));
    }

    Err(QueryError::PlanningError(format!(
        "unsupported cursor column type {} for '{}'",
        array.data_type(),
        field
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_single_key_predicate() {
        let cursor = KeysetCursor::new(vec![Value::Int(42)]);
        assert_eq!(
            cursor.render_predicate(&[SortField::asc("id")]).unwrap(),
            "(id > 42 OR id IS NULL)"
        );
        assert_eq!(
            cursor.render_predicate(&[SortField::desc("id")]).unwrap(),
            "(id < 42 OR id IS NULL)"
        );
    }

    #[test]
    fn test_mixed_direction_predicate() {
        let cursor = KeysetCursor::new(vec![Value::from("2024-01-01"), Value::Int(7)]);
        let sort = vec![SortField::desc("created_at"), SortField::asc("id")];
        assert_eq!(
            cursor.render_predicate(&sort).unwrap(),
            "(created_at < '2024-01-01' OR created_at IS NULL) OR \
             (created_at = '2024-01-01' AND (id > 7 OR id IS NULL))"
        );
    }

    #[test]
    fn test_null_cursor_values() {
        let sort = vec![SortField::asc("a"), SortField::asc("b")];

        // a NULL leading key can only be followed by rows sharing that NULL
        let cursor = KeysetCursor::new(vec![Value::Null, Value::Int(5)]);
        let predicate = cursor.render_predicate(&sort).unwrap();
        assert_eq!(predicate, "(a IS NULL AND (b > 5 OR b IS NULL))");
        assert!(!predicate.contains("= NULL"));
        assert!(!predicate.contains("> NULL"));

        let cursor = KeysetCursor::new(vec![Value::Int(3), Value::Null]);
        assert_eq!(cursor.render_predicate(&sort).unwrap(), "(a > 3 OR a IS NULL)");

        let cursor = KeysetCursor::new(vec![Value::Null, Value::Null]);
        assert_eq!(cursor.render_predicate(&sort).unwrap(), "1 = 0");
    }

    #[test]
    fn test_cursor_arity_mismatch() {
        let cursor = KeysetCursor::new(vec![Value::Int(1)]);
        let sort = vec![SortField::asc("a"), SortField::asc("b")];
        assert!(cursor.render_predicate(&sort).is_err());
        assert!(cursor.render_predicate(&[]).is_err());
    }

    #[test]
    fn test_from_last_row() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None])),
            ],
        )
        .unwrap();

        let cursor = KeysetCursor::from_last_row(&batch, &[SortField::asc("id"), SortField::asc("name")])
            .unwrap()
            .unwrap();
        assert_eq!(cursor.values, vec![Value::Int(3), Value::Null]);

        let missing = KeysetCursor::from_last_row(&batch, &[SortField::asc("created_at")]);
        assert!(missing.is_err());

        let empty = batch.slice(0, 0);
        assert!(KeysetCursor::from_last_row(&empty, &[SortField::asc("id")])
            .unwrap()
            .is_none());
    }
}
