//! stratadb: an on-disk, single-writer, schema-validated transactional
//! database engine.
//!
//! A database is a sequence of JSON records appended to a log file: the
//! first record is a schema, every record after it a transaction delta.
//! [`file::File`] owns the log and drives replay and online compaction;
//! [`database::Database`] is the in-memory image those records build.

pub mod database;
pub mod error;
pub mod execute;
pub mod file;
pub mod log;
pub mod schema;
pub mod tool;
pub mod txn;
pub mod types;

pub use database::Database;
pub use error::{DbError, Result};
pub use file::File;
pub use schema::Schema;
