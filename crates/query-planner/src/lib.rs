//! Query planning for the distributed index layer
//!
//! - [`sql`]: the only place caller input is turned into SQL text
//! - [`validator`]: sort field allow-listing and `ORDER BY` rendering
//! - [`strategy`]: in-memory vs. streaming selection by estimated rows
//! - [`cursor`]: keyset pagination for streaming chunks

pub mod cursor;
pub mod sql;
pub mod strategy;
pub mod validator;

pub use cursor::KeysetCursor;
pub use sql::{
    contains_keyword, find_top_level_keyword, render_conditions, render_literal, render_predicate,
    sanitize_field,
};
pub use strategy::{validate_sort_fields_for_scale, ExecutionStrategy, StrategyDecision};
pub use validator::{generate_order_by_clause, parse_sort_spec, validate_sort_fields};
