//! Sort field validation against per-entity allow-lists

use crate::sql::sanitize_field;
use query_core::{QueryError, Result, SortField, SortOptions};

/// Validate requested sort fields for `entity`.
///
/// Checks run cheapest first: field count, then each field's characters,
/// then membership in the allow-list. Valid input is returned unchanged.
pub fn validate_sort_fields(
    entity: &str,
    requested: &[SortField],
    opts: &SortOptions,
) -> Result<Vec<SortField>> {
    if requested.len() > opts.max_fields {
        return Err(QueryError::TooManyFields {
            requested: requested.len(),
            max: opts.max_fields,
        });
    }

    for sort in requested {
        sanitize_field(&sort.field)?;
        if !opts.allowed_fields.contains(&sort.field) {
            return Err(QueryError::InvalidField {
                field: sort.field.clone(),
                entity: entity.to_string(),
            });
        }
    }

    Ok(requested.to_vec())
}

/// Render `ORDER BY a DESC, b ASC` in input order. Empty input renders `""`.
pub fn generate_order_by_clause(validated: &[SortField]) -> String {
    if validated.is_empty() {
        return String::new();
    }
    let keys: Vec<String> = validated
        .iter()
        .map(|s| format!("{} {}", s.field, s.order))
        .collect();
    format!("ORDER BY {}", keys.join(", "))
}

/// Parse `field[:asc|:desc]` lists such as `created_at:desc,tenant_id`.
pub fn parse_sort_spec(spec: &str) -> Result<Vec<SortField>> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (field, order) = match part.rsplit_once(':') {
                Some((field, order)) => (field.trim(), order.trim()),
                None => (part, "asc"),
            };
            match order.to_ascii_lowercase().as_str() {
                "asc" => Ok(SortField::asc(field)),
                "desc" => Ok(SortField::desc(field)),
                other => Err(QueryError::PlanningError(format!(
                    "unknown sort direction '{}' for field '{}'",
                    other, field
                ))),
            }
        })
        .collect()
}
