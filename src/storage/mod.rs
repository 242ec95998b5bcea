//! Result storage
//!
//! The orchestration core hands every scraped page to a `ResultSink` and records
//! each finished job's summary there. `SqliteSink` keeps both in a SQLite file;
//! `NullSink` drops them.

mod schema;
mod sqlite;
mod traits;

pub use sqlite::{JobRecord, SqliteSink, StoredPage};
pub use traits::{NullSink, ResultSink, StorageError, StorageResult};

use std::path::Path;

/// Opens or creates a SQLite result database
pub fn open_sink(path: &Path) -> StorageResult<SqliteSink> {
    SqliteSink::new(path)
}
