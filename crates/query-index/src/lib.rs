//! Metadata index for files written by the ingest pipeline
//!
//! Three tables are kept per tenant: one row per file, one row per record
//! and one summary per directory. Searches run against these tables only, so
//! finding records spread over many files never opens the files themselves.
//!
//! - [`store`]: ingest with replace-on-rewrite and directory recomputation
//! - [`search`]: cross-file record search, latest records, summaries
//! - [`hash`]: exact-match indexes on `status` and `category`
//! - [`snapshot`]: Parquet persistence of the record table
//!
//! # Example
//!
//! ```ignore
//! use query_index::{CrossFileQueryService, MetadataIndexStore, SearchRequest};
//!
//! let store = Arc::new(MetadataIndexStore::new());
//! store.ingest_file(file, records)?;
//! let service = CrossFileQueryService::new(store, default_record_sort_options());
//! let result = service.search_records_across_files(
//!     &SearchRequest::new("acme").with_condition("name", Predicate::contains("alice")),
//! )?;
//! ```

pub mod hash;
pub mod search;
pub mod snapshot;
pub mod store;
pub mod types;

pub use hash::{HashIndex, RecordKey};
pub use search::{default_record_sort_options, CrossFileQueryService, SearchRequest, SearchResult};
pub use snapshot::{read_snapshot, write_snapshot};
pub use store::MetadataIndexStore;
pub use types::*;
