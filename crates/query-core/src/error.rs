use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid field '{field}' for entity '{entity}'")]
    InvalidField { field: String, entity: String },

    #[error("Unsafe field name '{0}': only [A-Za-z0-9_.] is allowed")]
    UnsafeField(String),

    #[error("Too many sort fields: {requested} requested, at most {max} allowed")]
    TooManyFields { requested: usize, max: usize },

    #[error("Sort field '{field}' on entity '{entity}' requires an index for streaming execution")]
    MissingIndex { field: String, entity: String },

    #[error("Invalid predicate on '{field}': {reason}")]
    InvalidPredicate { field: String, reason: String },

    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    ParquetError(String),
}

impl QueryError {
    /// Errors caused by caller input; surfaced verbatim and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidField { .. }
                | QueryError::UnsafeField(_)
                | QueryError::TooManyFields { .. }
                | QueryError::MissingIndex { .. }
                | QueryError::InvalidPredicate { .. }
                | QueryError::UnknownEntity(_)
        )
    }
}

impl From<parquet::errors::ParquetError> for QueryError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        QueryError::ParquetError(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
