//! Ties a `Log` to a `Database` image: initial load (schema + replay),
//! commit (serialize a transaction's changes and append), and the online
//! compaction state machine.
//!
//! Grounded in `ovsdb_file_open`/`ovsdb_file_commit`/`ovsdb_file_compact` in
//! `ovsdb/file.c`. The compaction gate constants below are the ones that
//! file uses verbatim.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value as Json;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::log::{Locking, Log, OpenMode, MAGIC_DB};
use crate::schema::{self, Schema};
use crate::txn::{record_to_txn, txn_to_record, Transaction};

/// Minimum time since the last successful compaction before another is
/// attempted, in milliseconds.
const COMPACT_MIN_MSEC: i64 = 10 * 60 * 1000;
/// Backoff after a failed compaction attempt, in milliseconds.
const COMPACT_RETRY_MSEC: i64 = 60 * 1000;
/// Minimum transactions appended since the last compaction.
const COMPACT_MIN_TRANSACTIONS: u64 = 100;
/// Minimum log size, in bytes, before compaction is considered.
const COMPACT_MIN_LOG_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Compacting,
    Backoff,
}

pub struct File {
    log: Log,
    read_only: bool,
    last_compact_ms: i64,
    next_compact_ms: i64,
    n_transactions: u64,
    snapshot_size_bytes: u64,
    state: CompactionState,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

impl File {
    /// Open `path`, read its schema record, and replay every following
    /// record into a fresh `Database` image.
    ///
    /// When `alternate_schema` is given, the stored schema is discarded in
    /// favor of it and every subsequent record is replayed in converting
    /// mode (unknown tables/columns silently dropped).
    pub fn open(
        path: impl AsRef<Path>,
        alternate_schema: Option<Schema>,
        read_only: bool,
        locking: Locking,
    ) -> Result<(File, Database)> {
        let mode = if read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        let mut log = Log::open(path, MAGIC_DB, &[MAGIC_DB], mode, locking)?;

        let schema_record = log
            .read()?
            .ok_or_else(|| DbError::framing("database file has no schema record"))?;
        let stored_schema = schema::schema_from_json(&schema_record)?;
        let converting = alternate_schema.is_some();
        let schema = alternate_schema.unwrap_or(stored_schema);

        let mut db = Database::empty(schema);

        let mut n_transactions = 0u64;
        let mut snapshot_size_bytes = 0u64;
        loop {
            match log.read() {
                Ok(Some(record)) => match record_to_txn(&mut db, &record, converting) {
                    Ok(_) => {
                        n_transactions += 1;
                        if n_transactions == 1 {
                            snapshot_size_bytes = log.offset().unwrap_or(0);
                        }
                    }
                    Err(e) => {
                        log::warn!("discarding unreadable trailing record: {}", e);
                        log.unread()?;
                        break;
                    }
                },
                Ok(None) => break,
                // A framing error on a fully-present record still stops
                // replay rather than failing the open: the file is
                // considered open with the image reached so far.
                Err(e) => {
                    log::error!("stopping replay at a corrupt record: {}", e);
                    break;
                }
            }
        }

        let file = File {
            log,
            read_only,
            last_compact_ms: now_ms(),
            next_compact_ms: 0,
            n_transactions,
            snapshot_size_bytes,
            state: CompactionState::Idle,
        };

        log::info!(
            "opened database with {} transactions replayed",
            n_transactions
        );

        Ok((file, db))
    }

    /// Read just the schema record of `path`, without locking or loading
    /// the rest of the log.
    pub fn read_schema(path: impl AsRef<Path>) -> Result<Schema> {
        let mut log = Log::open(path, MAGIC_DB, &[MAGIC_DB], OpenMode::ReadOnly, Locking::ForbidLock)?;
        let record = log
            .read()?
            .ok_or_else(|| DbError::framing("database file has no schema record"))?;
        schema::schema_from_json(&record)
    }

    /// Create a new database file at `path` containing only `schema`'s
    /// record. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, schema: &Schema) -> Result<()> {
        let mut log = Log::open(
            path,
            MAGIC_DB,
            &[MAGIC_DB],
            OpenMode::CreateExcl,
            Locking::ForbidLock,
        )?;
        log.append(&schema::schema_to_json(schema))?;
        log.commit()
    }

    /// Append a non-empty transaction's changes as one record, then
    /// evaluate whether this commit should trigger a compaction.
    pub fn commit(&mut self, txn: &Transaction, db: &Database, durable: bool) -> Result<()> {
        if self.read_only {
            return Err(DbError::state("file is read-only"));
        }
        let Some(record) = txn_to_record(txn, &db.schema, now_ms()) else {
            return Ok(());
        };
        self.log.append(&record)?;
        if durable {
            self.log.commit()?;
        }
        self.n_transactions += 1;

        if self.should_compact()? {
            if let Err(e) = self.compact(db) {
                log::warn!("online compaction failed, backing off: {}", e);
                self.state = CompactionState::Backoff;
                self.next_compact_ms = now_ms() + COMPACT_RETRY_MSEC;
            }
        }
        Ok(())
    }

    fn should_compact(&mut self) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }
        let now = now_ms();
        if now < self.next_compact_ms {
            return Ok(false);
        }
        if self.n_transactions < COMPACT_MIN_TRANSACTIONS {
            return Ok(false);
        }
        let log_size = self.log.offset()?;
        if log_size < COMPACT_MIN_LOG_BYTES {
            return Ok(false);
        }
        if log_size / 4 < self.snapshot_size_bytes {
            return Ok(false);
        }
        Ok(true)
    }

    /// Replace the log with `{schema, snapshot-of-db}` in place.
    pub fn compact(&mut self, db: &Database) -> Result<()> {
        if self.read_only {
            return Err(DbError::state("file is read-only"));
        }
        self.state = CompactionState::Compacting;
        let comment = format!(
            "compacting database online ({:.3} seconds old, {} transactions, {} bytes)",
            (now_ms() - self.last_compact_ms) as f64 / 1000.0,
            self.n_transactions,
            self.log.offset()?
        );
        log::info!("{}", comment);

        let schema_record = schema::schema_to_json(&db.schema);
        let snapshot = snapshot_record(db);

        let mut new_log = self.log.replace_start()?;
        new_log.append(&schema_record)?;
        new_log.append(&snapshot)?;
        new_log.commit()?;
        self.log.replace_commit(new_log)?;

        self.n_transactions = 1;
        self.last_compact_ms = now_ms();
        self.next_compact_ms = self.last_compact_ms + COMPACT_MIN_MSEC;
        self.snapshot_size_bytes = self.log.offset()?;
        self.state = CompactionState::Idle;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn state(&self) -> CompactionState {
        self.state
    }
}

/// Write a fresh log at `path` containing the schema record and one
/// transaction record with the full contents of `db` as inserts. On any
/// error, the partially written file is removed.
pub fn save_copy(path: impl AsRef<Path>, db: &Database) -> Result<()> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let result = (|| -> Result<()> {
        let mut log = Log::open(
            &path,
            MAGIC_DB,
            &[MAGIC_DB],
            OpenMode::CreateExcl,
            Locking::ForbidLock,
        )?;
        log.append(&schema::schema_to_json(&db.schema))?;
        log.append(&snapshot_record(db))?;
        log.commit()
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result
}

fn snapshot_record(db: &Database) -> Json {
    let mut txn = Transaction::new();
    for (table_name, table) in &db.tables {
        for row in table.iter() {
            txn.changes
                .entry(table_name.clone())
                .or_default()
                .insert(row.uuid, crate::txn::RowChange::Insert(row.clone()));
        }
    }
    txn_to_record(&txn, &db.schema, now_ms()).unwrap_or_else(|| Json::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::schema_from_json;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_schema() -> Schema {
        schema_from_json(&serde_json::json!({
            "name": "t",
            "version": "1.0.0",
            "tables": { "items": { "columns": { "x": {"type": "integer"} } } }
        }))
        .unwrap()
    }

    #[test]
    fn create_then_open_round_trips_empty_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        File::create(&path, &sample_schema()).unwrap();
        let (_file, db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
        assert_eq!(db.schema.name, "t");
    }

    #[test]
    fn commit_then_reopen_replays_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        File::create(&path, &sample_schema()).unwrap();
        let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();

        let mut txn = Transaction::new();
        let uuid = Uuid::new_v4();
        let mut row = crate::types::Row::new(uuid);
        row.values
            .insert("x".to_string(), crate::types::Datum::Integer(7));
        txn.insert(&mut db, "items", row).unwrap();
        file.commit(&txn, &db, true).unwrap();
        drop(file);

        let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
        let row = db2.table("items").unwrap().get(&uuid).unwrap();
        assert_eq!(row.get("x"), Some(&crate::types::Datum::Integer(7)));
    }

    #[test]
    fn read_schema_does_not_require_exclusive_access() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        File::create(&path, &sample_schema()).unwrap();
        let schema = File::read_schema(&path).unwrap();
        assert_eq!(schema.name, "t");
    }
}
