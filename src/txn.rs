//! Transaction serializer: converts a committed in-memory transaction delta
//! into the JSON record shape, and converts a record back into a
//! transaction applied to a database image.
//!
//! Grounded in `ovsdb_file_txn_row_from_json`/`ovsdb_file_txn_add_row` in
//! `ovsdb/file.c`: row ops are `null` for delete, an object of column
//! values for insert/modify, and only non-default persistent columns are
//! ever written back out for an insert.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::types::{Datum, Row};

/// One row's recorded delta within a transaction, used to drive
/// `txn_to_record`.
#[derive(Debug, Clone)]
pub enum RowChange {
    Insert(Row),
    Modify { new: Row, changed: BTreeSet<String> },
    Delete,
}

/// A pending set of per-table, per-row changes. Applying a `Transaction` to
/// a `Database` and then serializing it with `txn_to_record` are the two
/// halves of the replay/commit round trip.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub changes: BTreeMap<String, BTreeMap<Uuid, RowChange>>,
    pub comment: Option<String>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(|t| t.is_empty())
    }

    fn table_changes(&mut self, table: &str) -> &mut BTreeMap<Uuid, RowChange> {
        self.changes.entry(table.to_string()).or_default()
    }

    /// Insert a new row into `db`, recording the change.
    pub fn insert(&mut self, db: &mut Database, table: &str, row: Row) -> Result<()> {
        let uuid = row.uuid;
        if db.table(table).and_then(|t| t.get(&uuid)).is_some() {
            return Err(DbError::conflict(format!(
                "row {} already exists in table '{}'",
                uuid, table
            )));
        }
        db.table_mut(table).rows.insert(uuid, row.clone());
        self.table_changes(table).insert(uuid, RowChange::Insert(row));
        Ok(())
    }

    /// Overwrite the given columns of an existing row, recording the change.
    pub fn modify(
        &mut self,
        db: &mut Database,
        table: &str,
        uuid: Uuid,
        values: BTreeMap<String, Datum>,
    ) -> Result<()> {
        let t = db.table_mut(table);
        let row = t.rows.get_mut(&uuid).ok_or_else(|| {
            DbError::conflict(format!("row {} not found in table '{}'", uuid, table))
        })?;
        let mut changed = BTreeSet::new();
        for (col, val) in values {
            row.values.insert(col.clone(), val);
            changed.insert(col);
        }
        let new = row.clone();
        let entry = self.table_changes(table);
        let prior = entry.get(&uuid);
        let recorded = match prior {
            // Row was inserted earlier in this same transaction; keep
            // recording it as an insert with the updated values.
            Some(RowChange::Insert(_)) => RowChange::Insert(new),
            Some(RowChange::Modify { changed: prior, .. }) => {
                let mut merged = prior.clone();
                merged.extend(changed);
                RowChange::Modify { new, changed: merged }
            }
            _ => RowChange::Modify { new, changed },
        };
        entry.insert(uuid, recorded);
        Ok(())
    }

    /// Delete an existing row, recording the change.
    pub fn delete(&mut self, db: &mut Database, table: &str, uuid: Uuid) -> Result<()> {
        let t = db.table_mut(table);
        if t.rows.remove(&uuid).is_none() {
            return Err(DbError::conflict(format!(
                "row {} not found in table '{}'",
                uuid, table
            )));
        }
        self.table_changes(table).insert(uuid, RowChange::Delete);
        Ok(())
    }
}

/// Apply a transaction-record JSON document to `db`, producing the
/// `Transaction` that performed the replay.
///
/// When `converting` is true, tables and columns absent from `db`'s schema
/// are silently dropped; otherwise they are syntax errors.
pub fn record_to_txn(db: &mut Database, json: &Json, converting: bool) -> Result<Transaction> {
    let obj = json
        .as_object()
        .ok_or_else(|| DbError::syntax("transaction record must be a JSON object"))?;

    let mut txn = Transaction::new();

    for (key, value) in obj {
        if key == "_date" || key == "_comment" {
            continue;
        }
        let Some(table_schema) = db.schema.find_table(key).cloned() else {
            if converting {
                continue;
            }
            return Err(DbError::syntax(format!("unknown table '{}'", key)));
        };
        let table_delta = value
            .as_object()
            .ok_or_else(|| DbError::syntax(format!("table delta for '{}' must be an object", key)))?;

        for (uuid_str, row_op) in table_delta {
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|_| DbError::syntax(format!("invalid row uuid '{}'", uuid_str)))?;

            if row_op.is_null() {
                txn.delete(db, key, uuid)?;
                continue;
            }

            let row_obj = row_op
                .as_object()
                .ok_or_else(|| DbError::syntax(format!("row op for {} must be null or an object", uuid)))?;

            let exists = db.table(key).and_then(|t| t.get(&uuid)).is_some();
            if exists {
                let values = collect_values(&table_schema, row_obj, converting)?;
                txn.modify(db, key, uuid, values)?;
            } else {
                let mut row = Row::new(uuid);
                for col in &table_schema.columns {
                    row.values.insert(col.name.clone(), col.default_datum()?);
                }
                let values = collect_values(&table_schema, row_obj, converting)?;
                for (col, val) in values {
                    row.values.insert(col, val);
                }
                txn.insert(db, key, row)?;
            }
        }
    }

    if let Some(comment) = obj.get("_comment").and_then(Json::as_str) {
        txn.comment = Some(comment.to_string());
    }

    Ok(txn)
}

fn collect_values(
    table: &crate::types::TableSchema,
    row_obj: &Map<String, Json>,
    converting: bool,
) -> Result<BTreeMap<String, Datum>> {
    let mut values = BTreeMap::new();
    for (col_name, col_val) in row_obj {
        let Some(col) = table.find_column(col_name) else {
            if converting {
                continue;
            }
            return Err(DbError::syntax(format!(
                "unknown column '{}' in table '{}'",
                col_name, table.name
            )));
        };
        let datum = Datum::from_json(col_val, col.data_type()?, col_name)?;
        values.insert(col_name.clone(), datum);
    }
    Ok(values)
}

/// Serialize a transaction's changes back into a record, per §4.3: inserts
/// emit only non-default persistent columns (excluding `_uuid`), modifies
/// emit only the changed columns, deletes emit `null`. A transaction with
/// no changes serializes to `None` (no record at all).
pub fn txn_to_record(txn: &Transaction, schema: &crate::schema::Schema, now_ms: i64) -> Option<Json> {
    if txn.is_empty() {
        return None;
    }

    let mut root = Map::new();
    for (table_name, rows) in &txn.changes {
        if rows.is_empty() {
            continue;
        }
        let table_schema = schema.find_table(table_name);
        let mut table_delta = Map::new();
        for (uuid, change) in rows {
            let value = match change {
                RowChange::Delete => Json::Null,
                RowChange::Insert(row) => {
                    let mut obj = Map::new();
                    for (col_name, datum) in &row.values {
                        let persistent = table_schema
                            .and_then(|t| t.find_column(col_name))
                            .map(|c| c.persistent)
                            .unwrap_or(true);
                        if !persistent {
                            continue;
                        }
                        if datum.is_default(datum.data_type()) {
                            continue;
                        }
                        obj.insert(col_name.clone(), datum.to_json());
                    }
                    Json::Object(obj)
                }
                RowChange::Modify { new, changed } => {
                    let mut obj = Map::new();
                    for col_name in changed {
                        if let Some(datum) = new.values.get(col_name) {
                            obj.insert(col_name.clone(), datum.to_json());
                        }
                    }
                    Json::Object(obj)
                }
            };
            table_delta.insert(uuid.to_string(), value);
        }
        if !table_delta.is_empty() {
            root.insert(table_name.clone(), Json::Object(table_delta));
        }
    }

    if root.is_empty() {
        return None;
    }

    if let Some(comment) = &txn.comment {
        root.insert("_comment".into(), Json::String(comment.clone()));
    }
    root.insert("_date".into(), Json::from(now_ms));

    Some(Json::Object(root))
}
