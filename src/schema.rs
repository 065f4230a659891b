//! Schema codec: parses a JSON schema document into a typed `Schema`, and
//! serializes it back with a stable textual checksum.
//!
//! Grounded in `ovsdb/ovsdb-tool.c`'s schema-from-file handling: a schema is
//! just another record, identified by the fields it carries (`name`,
//! `version`, `cksum`, `tables`), with the checksum recomputed from the
//! canonical form rather than trusted from the stored field.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use sha1::{Digest, Sha1};

use crate::error::{DbError, Result};
use crate::types::{ColumnSchema, TableSchema};

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub version: String,
    pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn find_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Stable SHA-1 checksum over the canonical (sorted-key) JSON form.
    pub fn cksum(&self) -> String {
        let canonical = canonicalize(&self.to_json());
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> Json {
        let mut tables = Map::new();
        for (name, table) in &self.tables {
            let mut columns = Map::new();
            for col in &table.columns {
                let mut c = Map::new();
                c.insert("type".into(), Json::String(col.ty_name.clone()));
                if !col.persistent {
                    c.insert("persistent".into(), Json::Bool(false));
                }
                if let Some(d) = &col.default {
                    c.insert("default".into(), d.clone());
                }
                columns.insert(col.name.clone(), Json::Object(c));
            }
            let mut t = Map::new();
            t.insert("columns".into(), Json::Object(columns));
            tables.insert(name.clone(), Json::Object(t));
        }
        let mut root = Map::new();
        root.insert("name".into(), Json::String(self.name.clone()));
        root.insert("version".into(), Json::String(self.version.clone()));
        root.insert("tables".into(), Json::Object(tables));
        Json::Object(root)
    }
}

/// Structural equality: name, version, tables, columns, types and
/// per-column `persistent`. The `cksum` field itself is never consulted.
pub fn schema_equal(a: &Schema, b: &Schema) -> bool {
    if a.name != b.name || a.version != b.version || a.tables.len() != b.tables.len() {
        return false;
    }
    for (name, ta) in &a.tables {
        let Some(tb) = b.tables.get(name) else {
            return false;
        };
        if ta.columns.len() != tb.columns.len() {
            return false;
        }
        for ca in &ta.columns {
            let Some(cb) = tb.columns.iter().find(|c| c.name == ca.name) else {
                return false;
            };
            if ca.ty_name != cb.ty_name || ca.persistent != cb.persistent {
                return false;
            }
        }
    }
    true
}

pub fn schema_from_json(json: &Json) -> Result<Schema> {
    let obj = json
        .as_object()
        .ok_or_else(|| DbError::syntax("schema must be a JSON object"))?;
    let name = obj
        .get("name")
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DbError::syntax("schema is missing a non-empty 'name'"))?
        .to_string();
    let version = obj
        .get("version")
        .and_then(Json::as_str)
        .unwrap_or("0.0.0")
        .to_string();
    let tables_json = obj
        .get("tables")
        .and_then(Json::as_object)
        .ok_or_else(|| DbError::syntax("schema is missing a 'tables' object"))?;

    let mut tables = BTreeMap::new();
    for (table_name, table_val) in tables_json {
        let table_obj = table_val
            .as_object()
            .ok_or_else(|| DbError::syntax(format!("table '{}' is not an object", table_name)))?;
        let columns_json = table_obj
            .get("columns")
            .and_then(Json::as_object)
            .ok_or_else(|| {
                DbError::syntax(format!("table '{}' is missing 'columns'", table_name))
            })?;
        let mut columns = Vec::new();
        for (idx, (col_name, col_val)) in columns_json.iter().enumerate() {
            if col_name == "_uuid" {
                return Err(DbError::syntax(format!(
                    "table '{}' may not declare a '_uuid' column explicitly",
                    table_name
                )));
            }
            let col_obj = col_val.as_object().ok_or_else(|| {
                DbError::syntax(format!(
                    "column '{}.{}' is not an object",
                    table_name, col_name
                ))
            })?;
            let ty_name = col_obj
                .get("type")
                .and_then(Json::as_str)
                .ok_or_else(|| {
                    DbError::syntax(format!(
                        "column '{}.{}' is missing a 'type'",
                        table_name, col_name
                    ))
                })?
                .to_string();
            // Validate the type name eagerly so malformed schemas fail at load time.
            crate::types::DataType::from_name(&ty_name)?;
            let persistent = col_obj
                .get("persistent")
                .and_then(Json::as_bool)
                .unwrap_or(true);
            let default = col_obj.get("default").cloned();
            columns.push(ColumnSchema {
                name: col_name.clone(),
                ty_name,
                persistent,
                default,
                index: idx,
            });
        }
        tables.insert(
            table_name.clone(),
            TableSchema {
                name: table_name.clone(),
                columns,
            },
        );
    }

    Ok(Schema {
        name,
        version,
        tables,
    })
}

pub fn schema_to_json(schema: &Schema) -> Json {
    schema.to_json()
}

/// Canonical form used for checksumming: a JSON string with object keys in
/// sorted order and no insignificant whitespace.
fn canonicalize(value: &Json) -> String {
    fn sort(value: &Json) -> Json {
        match value {
            Json::Object(map) => {
                let mut sorted = Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                Json::Object(sorted)
            }
            Json::Array(items) => Json::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).expect("canonical JSON never fails to serialize")
}

/// Minimal hex encoding, avoiding a pull on an extra crate for the one
/// checksum call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Json {
        serde_json::json!({
            "name": "testdb",
            "version": "1.0.0",
            "tables": {
                "t": {
                    "columns": {
                        "x": {"type": "integer"}
                    }
                }
            }
        })
    }

    #[test]
    fn round_trips_through_json() {
        let schema = schema_from_json(&sample()).unwrap();
        assert_eq!(schema.name, "testdb");
        let table = schema.find_table("t").unwrap();
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].name, "x");
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = schema_from_json(&sample()).unwrap();
        let b = schema_from_json(&sample()).unwrap();
        assert_eq!(a.cksum(), b.cksum());
    }

    #[test]
    fn rejects_explicit_uuid_column() {
        let mut bad = sample();
        bad["tables"]["t"]["columns"]["_uuid"] = serde_json::json!({"type": "string"});
        assert!(schema_from_json(&bad).is_err());
    }

    #[test]
    fn schema_equal_ignores_cksum_and_whitespace() {
        let a = schema_from_json(&sample()).unwrap();
        let b = schema_from_json(&sample()).unwrap();
        assert!(schema_equal(&a, &b));
    }
}
