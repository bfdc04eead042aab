//! Pure SQL rendering functions
//!
//! Every identifier emitted here passes through [`sanitize_field`] and every
//! caller-supplied literal through [`render_literal`]. Nothing else in the
//! workspace builds SQL text from caller input.

use query_core::{is_safe_identifier, Conditions, Predicate, QueryError, RangeBound, Result, Value};

/// Accept a field name only if it is made of `[A-Za-z0-9_.]`.
pub fn sanitize_field(name: &str) -> Result<&str> {
    if is_safe_identifier(name) {
        Ok(name)
    } else {
        Err(QueryError::UnsafeField(name.to_string()))
    }
}

/// Render a literal value as SQL text.
pub fn render_literal(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
        Value::Int(v) => Ok(v.to_string()),
        Value::Float(v) if v.is_finite() => Ok(format!("{:?}", v)),
        Value::Float(v) => Err(QueryError::InvalidPredicate {
            field: String::new(),
            reason: format!("non-finite literal {}", v),
        }),
        Value::String(s) => Ok(quote_string(s)),
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn with_field(err: QueryError, field: &str) -> QueryError {
    match err {
        QueryError::InvalidPredicate { reason, .. } => QueryError::InvalidPredicate {
            field: field.to_string(),
            reason,
        },
        other => other,
    }
}

fn render_bound(field: &str, bound: &RangeBound, lower: bool) -> Result<String> {
    let op = match (lower, bound.inclusive) {
        (true, true) => ">=",
        (true, false) => ">",
        (false, true) => "<=",
        (false, false) => "<",
    };
    let literal = render_literal(&bound.value).map_err(|e| with_field(e, field))?;
    Ok(format!("{} {} {}", field, op, literal))
}

/// Render one field predicate, e.g. `status = 'active'`.
pub fn render_predicate(field: &str, predicate: &Predicate) -> Result<String> {
    let field = sanitize_field(field)?;
    match predicate {
        Predicate::Eq(Value::Null) => Ok(format!("{} IS NULL", field)),
        Predicate::Eq(value) => {
            let literal = render_literal(value).map_err(|e| with_field(e, field))?;
            Ok(format!("{} = {}", field, literal))
        }
        Predicate::In(values) => {
            if values.is_empty() {
                return Err(QueryError::InvalidPredicate {
                    field: field.to_string(),
                    reason: "empty IN list".to_string(),
                });
            }
            let literals = values
                .iter()
                .map(render_literal)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| with_field(e, field))?;
            Ok(format!("{} IN ({})", field, literals.join(", ")))
        }
        Predicate::Range { lower, upper } => {
            let mut parts = Vec::with_capacity(2);
            if let Some(bound) = lower {
                parts.push(render_bound(field, bound, true)?);
            }
            if let Some(bound) = upper {
                parts.push(render_bound(field, bound, false)?);
            }
            if parts.is_empty() {
                return Err(QueryError::InvalidPredicate {
                    field: field.to_string(),
                    reason: "range without bounds".to_string(),
                });
            }
            Ok(parts.join(" AND "))
        }
        Predicate::Contains(text) => Ok(format!(
            "{} ILIKE {}",
            field,
            quote_string(&format!("%{}%", escape_like(text)))
        )),
    }
}

/// Render all conditions joined by `AND`, in field-name order.
/// Returns an empty string for no conditions.
pub fn render_conditions(conditions: &Conditions) -> Result<String> {
    let parts = conditions
        .iter()
        .map(|(field, predicate)| render_predicate(field, predicate))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(" AND "))
}

/// Case-insensitive check for a standalone SQL keyword outside quoted text.
pub fn contains_keyword(sql: &str, keyword: &str) -> bool {
    let upper = strip_quoted(sql).to_ascii_uppercase();
    let keyword = keyword.to_ascii_uppercase();
    upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == keyword)
}

/// Byte offset of the first `keyword` outside quoted text and parentheses.
pub fn find_top_level_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let mut in_quote = false;
    let mut depth = 0usize;
    let mut start = None;
    for (idx, c) in sql.char_indices().chain(std::iter::once((sql.len(), ' '))) {
        if !in_quote && (c.is_ascii_alphanumeric() || c == '_') {
            start.get_or_insert(idx);
            continue;
        }
        if let Some(begin) = start.take() {
            if depth == 0 && sql[begin..idx].eq_ignore_ascii_case(keyword) {
                return Some(begin);
            }
        }
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

fn strip_quoted(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    for c in sql.chars() {
        if c == '\'' {
            in_quote = !in_quote;
            out.push(' ');
        } else if in_quote {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_literal_escaping() {
        assert_eq!(render_literal(&Value::from("o'neil")).unwrap(), "'o''neil'");
        assert_eq!(render_literal(&Value::from(r"a\b")).unwrap(), r"'a\\b'");
        assert_eq!(render_literal(&Value::Int(-4)).unwrap(), "-4");
        assert_eq!(render_literal(&Value::Float(2.0)).unwrap(), "2.0");
        assert!(render_literal(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_render_predicates() {
        assert_eq!(
            render_predicate("tenant_id", &Predicate::eq("t1")).unwrap(),
            "tenant_id = 't1'"
        );
        assert_eq!(
            render_predicate("shard_key", &Predicate::In(vec![Value::Int(1), Value::Int(2)]))
                .unwrap(),
            "shard_key IN (1, 2)"
        );
        assert_eq!(
            render_predicate("ts", &Predicate::between(10, 20)).unwrap(),
            "ts >= 10 AND ts <= 20"
        );
        assert_eq!(
            render_predicate("name", &Predicate::contains("50%_off")).unwrap(),
            r"name ILIKE '%50\\%\\_off%'"
        );
        assert_eq!(
            render_predicate("deleted_at", &Predicate::Eq(Value::Null)).unwrap(),
            "deleted_at IS NULL"
        );
    }

    #[test]
    fn test_unsafe_field_never_rendered() {
        let err = render_predicate("x = 1 OR 1", &Predicate::eq(1)).unwrap_err();
        assert!(matches!(err, QueryError::UnsafeField(f) if f == "x = 1 OR 1"));
    }

    #[test]
    fn test_empty_in_list_rejected() {
        let err = render_predicate("status", &Predicate::In(vec![])).unwrap_err();
        assert!(matches!(err, QueryError::InvalidPredicate { field, .. } if field == "status"));
    }

    #[test]
    fn test_render_conditions_sorted_by_field() {
        let mut conditions = Conditions::new();
        conditions.insert("status".to_string(), Predicate::eq("active"));
        conditions.insert("category".to_string(), Predicate::eq("b2b"));
        assert_eq!(
            render_conditions(&conditions).unwrap(),
            "category = 'b2b' AND status = 'active'"
        );
        assert_eq!(render_conditions(&Conditions::new()).unwrap(), "");
    }

    #[test]
    fn test_contains_keyword_ignores_literals() {
        assert!(contains_keyword("SELECT * FROM t where a = 1", "WHERE"));
        assert!(!contains_keyword("SELECT * FROM t_where", "WHERE"));
        assert!(!contains_keyword("SELECT 'order by' FROM t", "ORDER"));
    }

    #[test]
    fn test_find_top_level_keyword() {
        let sql = "SELECT * FROM t where a = 1";
        assert_eq!(find_top_level_keyword(sql, "WHERE"), Some(16));

        let nested = "SELECT * FROM (SELECT * FROM t WHERE x = 1) AS s WHERE 'where' = y";
        let pos = find_top_level_keyword(nested, "WHERE").unwrap();
        assert_eq!(&nested[pos..], "WHERE 'where' = y");

        assert_eq!(find_top_level_keyword("SELECT 'where' FROM t_where", "WHERE"), None);
    }
}
