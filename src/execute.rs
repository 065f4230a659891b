//! A small op-based interpreter for the `query`/`transact` administrative
//! commands.
//!
//! This is deliberately not a general query planner: it supports exactly
//! the row operations needed to insert, select, update, delete and mutate
//! rows by a conjunction of simple comparisons. Every mutation it produces
//! still flows through the same [`crate::txn::Transaction`] machinery a
//! hand-built transaction would, so a bug here cannot corrupt durability.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::txn::Transaction;
use crate::types::Datum;

#[derive(Debug, Clone)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Includes,
}

impl Op {
    fn parse(s: &str) -> Result<Op> {
        match s {
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            "includes" => Ok(Op::Includes),
            other => Err(DbError::syntax(format!("unknown comparison operator '{}'", other))),
        }
    }
}

struct Clause {
    column: String,
    op: Op,
    value: Json,
}

fn parse_where(table: &crate::types::TableSchema, where_json: Option<&Json>) -> Result<Vec<Clause>> {
    let Some(where_json) = where_json else {
        return Ok(Vec::new());
    };
    let array = where_json
        .as_array()
        .ok_or_else(|| DbError::syntax("'where' must be an array of clauses"))?;
    let mut clauses = Vec::new();
    for item in array {
        let triple = item
            .as_array()
            .ok_or_else(|| DbError::syntax("each 'where' clause must be a 3-element array"))?;
        if triple.len() != 3 {
            return Err(DbError::syntax("each 'where' clause must be a 3-element array"));
        }
        let column = triple[0]
            .as_str()
            .ok_or_else(|| DbError::syntax("where clause column must be a string"))?
            .to_string();
        if table.find_column(&column).is_none() && column != "_uuid" {
            return Err(DbError::syntax(format!("unknown column '{}'", column)));
        }
        let op = Op::parse(
            triple[1]
                .as_str()
                .ok_or_else(|| DbError::syntax("where clause operator must be a string"))?,
        )?;
        clauses.push(Clause {
            column,
            op,
            value: triple[2].clone(),
        });
    }
    Ok(clauses)
}

fn matches(row: &crate::types::Row, clauses: &[Clause]) -> Result<bool> {
    for clause in clauses {
        let actual = if clause.column == "_uuid" {
            Datum::Uuid(row.uuid)
        } else {
            match row.get(&clause.column) {
                Some(d) => d.clone(),
                None => return Ok(false),
            }
        };
        let expected = Datum::from_json(&clause.value, actual.data_type(), &clause.column)?;
        let ok = match clause.op {
            Op::Eq => actual == expected,
            Op::Ne => actual != expected,
            Op::Lt => compare(&actual, &expected)? == std::cmp::Ordering::Less,
            Op::Le => compare(&actual, &expected)? != std::cmp::Ordering::Greater,
            Op::Gt => compare(&actual, &expected)? == std::cmp::Ordering::Greater,
            Op::Ge => compare(&actual, &expected)? != std::cmp::Ordering::Less,
            Op::Includes => match (&actual, &expected) {
                (Datum::String(a), Datum::String(b)) => a.contains(b.as_str()),
                _ => return Err(DbError::syntax("'includes' only applies to string columns")),
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare(a: &Datum, b: &Datum) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Datum::Integer(x), Datum::Integer(y)) => Ok(x.cmp(y)),
        (Datum::Real(x), Datum::Real(y)) => {
            x.partial_cmp(y).ok_or_else(|| DbError::syntax("NaN comparison"))
        }
        (Datum::String(x), Datum::String(y)) => Ok(x.cmp(y)),
        _ => Err(DbError::syntax("ordered comparison requires matching comparable types")),
    }
}

/// One op's result, surfaced back to the caller for `query`/`transact`
/// output.
#[derive(Debug, Clone)]
pub enum OpResult {
    Rows(Vec<Json>),
    Count(usize),
    Uuid(Uuid),
}

impl OpResult {
    pub fn to_json(&self) -> Json {
        match self {
            OpResult::Rows(rows) => Json::Array(rows.clone()),
            OpResult::Count(n) => Json::from(*n),
            OpResult::Uuid(u) => Json::String(u.to_string()),
        }
    }
}

/// Execute a JSON array of row operations against `db`, building one
/// `Transaction` of the mutations performed. Returns one `OpResult` per op,
/// in order.
pub fn execute(db: &mut Database, txn: &mut Transaction, ops: &[Json]) -> Result<Vec<OpResult>> {
    let mut results = Vec::with_capacity(ops.len());
    for op_json in ops {
        let op_obj = op_json
            .as_object()
            .ok_or_else(|| DbError::syntax("each op must be a JSON object"))?;
        let op_name = op_obj
            .get("op")
            .and_then(Json::as_str)
            .ok_or_else(|| DbError::syntax("op is missing an 'op' field"))?;
        let table_name = op_obj
            .get("table")
            .and_then(Json::as_str)
            .ok_or_else(|| DbError::syntax("op is missing a 'table' field"))?;
        let table_schema = db
            .schema
            .find_table(table_name)
            .cloned()
            .ok_or_else(|| DbError::syntax(format!("unknown table '{}'", table_name)))?;

        let result = match op_name {
            "insert" => exec_insert(db, txn, &table_schema, table_name, op_obj)?,
            "select" => exec_select(db, &table_schema, table_name, op_obj)?,
            "update" => exec_update(db, txn, &table_schema, table_name, op_obj)?,
            "delete" => exec_delete(db, txn, &table_schema, table_name, op_obj)?,
            "mutate" => exec_mutate(db, txn, &table_schema, table_name, op_obj)?,
            other => return Err(DbError::syntax(format!("unknown op '{}'", other))),
        };
        results.push(result);
    }
    Ok(results)
}

fn row_values_from_json(
    table: &crate::types::TableSchema,
    row_obj: &Map<String, Json>,
) -> Result<BTreeMap<String, Datum>> {
    let mut values = BTreeMap::new();
    for (col_name, col_val) in row_obj {
        let col = table
            .find_column(col_name)
            .ok_or_else(|| DbError::syntax(format!("unknown column '{}'", col_name)))?;
        values.insert(col_name.clone(), Datum::from_json(col_val, col.data_type()?, col_name)?);
    }
    Ok(values)
}

fn exec_insert(
    db: &mut Database,
    txn: &mut Transaction,
    table: &crate::types::TableSchema,
    table_name: &str,
    op: &Map<String, Json>,
) -> Result<OpResult> {
    let row_obj = op
        .get("row")
        .and_then(Json::as_object)
        .ok_or_else(|| DbError::syntax("insert op is missing a 'row' object"))?;
    let uuid = Uuid::new_v4();
    let mut row = crate::types::Row::new(uuid);
    for col in &table.columns {
        row.values.insert(col.name.clone(), col.default_datum()?);
    }
    for (col, val) in row_values_from_json(table, row_obj)? {
        row.values.insert(col, val);
    }
    txn.insert(db, table_name, row)?;
    Ok(OpResult::Uuid(uuid))
}

fn exec_select(
    db: &Database,
    table: &crate::types::TableSchema,
    table_name: &str,
    op: &Map<String, Json>,
) -> Result<OpResult> {
    let clauses = parse_where(table, op.get("where"))?;
    let columns: Option<Vec<&str>> = op
        .get("columns")
        .and_then(Json::as_array)
        .map(|a| a.iter().filter_map(Json::as_str).collect());

    let mut rows = Vec::new();
    if let Some(t) = db.table(table_name) {
        for row in t.iter() {
            if matches(row, &clauses)? {
                let mut obj = Map::new();
                obj.insert("_uuid".into(), Json::String(row.uuid.to_string()));
                let names: Vec<&str> = columns.clone().unwrap_or_else(|| table.column_names());
                for name in names {
                    if let Some(d) = row.get(name) {
                        obj.insert(name.to_string(), d.to_json());
                    }
                }
                rows.push(Json::Object(obj));
            }
        }
    }
    Ok(OpResult::Rows(rows))
}

fn matching_uuids(
    db: &Database,
    table_name: &str,
    clauses: &[Clause],
) -> Result<Vec<Uuid>> {
    let mut uuids = Vec::new();
    if let Some(t) = db.table(table_name) {
        for row in t.iter() {
            if matches(row, clauses)? {
                uuids.push(row.uuid);
            }
        }
    }
    Ok(uuids)
}

fn exec_update(
    db: &mut Database,
    txn: &mut Transaction,
    table: &crate::types::TableSchema,
    table_name: &str,
    op: &Map<String, Json>,
) -> Result<OpResult> {
    let row_obj = op
        .get("row")
        .and_then(Json::as_object)
        .ok_or_else(|| DbError::syntax("update op is missing a 'row' object"))?;
    let clauses = parse_where(table, op.get("where"))?;
    let uuids = matching_uuids(db, table_name, &clauses)?;
    let values = row_values_from_json(table, row_obj)?;
    for uuid in &uuids {
        txn.modify(db, table_name, *uuid, values.clone())?;
    }
    Ok(OpResult::Count(uuids.len()))
}

fn exec_delete(
    db: &mut Database,
    txn: &mut Transaction,
    table: &crate::types::TableSchema,
    table_name: &str,
    op: &Map<String, Json>,
) -> Result<OpResult> {
    let clauses = parse_where(table, op.get("where"))?;
    let uuids = matching_uuids(db, table_name, &clauses)?;
    for uuid in &uuids {
        txn.delete(db, table_name, *uuid)?;
    }
    Ok(OpResult::Count(uuids.len()))
}

fn exec_mutate(
    db: &mut Database,
    txn: &mut Transaction,
    table: &crate::types::TableSchema,
    table_name: &str,
    op: &Map<String, Json>,
) -> Result<OpResult> {
    let mutations = op
        .get("mutations")
        .and_then(Json::as_array)
        .ok_or_else(|| DbError::syntax("mutate op is missing a 'mutations' array"))?;
    let clauses = parse_where(table, op.get("where"))?;
    let uuids = matching_uuids(db, table_name, &clauses)?;

    for uuid in &uuids {
        let current = db
            .table(table_name)
            .and_then(|t| t.get(uuid))
            .cloned()
            .ok_or_else(|| DbError::conflict("row vanished mid-mutation"))?;
        let mut values = BTreeMap::new();
        for m in mutations {
            let triple = m
                .as_array()
                .ok_or_else(|| DbError::syntax("each mutation must be a 3-element array"))?;
            if triple.len() != 3 {
                return Err(DbError::syntax("each mutation must be a 3-element array"));
            }
            let col_name = triple[0]
                .as_str()
                .ok_or_else(|| DbError::syntax("mutation column must be a string"))?;
            let col = table
                .find_column(col_name)
                .ok_or_else(|| DbError::syntax(format!("unknown column '{}'", col_name)))?;
            let mutator = triple[1]
                .as_str()
                .ok_or_else(|| DbError::syntax("mutation operator must be a string"))?;
            let operand = Datum::from_json(&triple[2], col.data_type()?, col_name)?;
            let existing = current
                .get(col_name)
                .cloned()
                .unwrap_or(col.default_datum()?);
            let new_value = apply_mutator(mutator, &existing, &operand)?;
            values.insert(col_name.to_string(), new_value);
        }
        txn.modify(db, table_name, *uuid, values)?;
    }
    Ok(OpResult::Count(uuids.len()))
}

fn apply_mutator(mutator: &str, existing: &Datum, operand: &Datum) -> Result<Datum> {
    match (mutator, existing, operand) {
        ("+=", Datum::Integer(a), Datum::Integer(b)) => Ok(Datum::Integer(a + b)),
        ("+=", Datum::Real(a), Datum::Real(b)) => Ok(Datum::Real(a + b)),
        ("-=", Datum::Integer(a), Datum::Integer(b)) => Ok(Datum::Integer(a - b)),
        ("-=", Datum::Real(a), Datum::Real(b)) => Ok(Datum::Real(a - b)),
        ("*=", Datum::Integer(a), Datum::Integer(b)) => Ok(Datum::Integer(a * b)),
        ("*=", Datum::Real(a), Datum::Real(b)) => Ok(Datum::Real(a * b)),
        _ => Err(DbError::syntax(format!(
            "unsupported mutation operator '{}' for this column type",
            mutator
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::schema_from_json;

    fn db() -> Database {
        let schema = schema_from_json(&serde_json::json!({
            "name": "t",
            "version": "1.0.0",
            "tables": { "items": { "columns": { "x": {"type": "integer"} } } }
        }))
        .unwrap();
        Database::empty(schema)
    }

    #[test]
    fn insert_then_select_sees_it() {
        let mut database = db();
        let mut txn = Transaction::new();
        let ops = vec![
            serde_json::json!({"op": "insert", "table": "items", "row": {"x": 3}}),
            serde_json::json!({"op": "select", "table": "items", "columns": ["x"]}),
        ];
        let results = execute(&mut database, &mut txn, &ops).unwrap();
        let OpResult::Rows(rows) = &results[1] else {
            panic!("expected rows")
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["x"], 3);
    }

    #[test]
    fn mutate_increments_a_counter() {
        let mut database = db();
        let mut txn = Transaction::new();
        let ops = vec![serde_json::json!({"op": "insert", "table": "items", "row": {"x": 3}})];
        execute(&mut database, &mut txn, &ops).unwrap();
        let ops = vec![serde_json::json!({
            "op": "mutate", "table": "items",
            "mutations": [["x", "+=", 4]]
        })];
        execute(&mut database, &mut txn, &ops).unwrap();
        let row = database.table("items").unwrap().iter().next().unwrap();
        assert_eq!(row.get("x"), Some(&Datum::Integer(7)));
    }
}
