//! Typed columns and datums.
//!
//! A column's `DataType` determines how a JSON value is validated and how a
//! `Datum` is rendered back to JSON. Dispatch is always by the column's
//! declared tag, never by the dynamic shape of the incoming JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{DbError, Result};

/// The type grammar a column's `type` field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Uuid => "uuid",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "integer" => Ok(DataType::Integer),
            "real" => Ok(DataType::Real),
            "boolean" => Ok(DataType::Boolean),
            "string" => Ok(DataType::String),
            "uuid" => Ok(DataType::Uuid),
            other => Err(DbError::syntax(format!("unknown column type '{}'", other))),
        }
    }

    /// The type's zero value, used as a column's implicit default.
    pub fn zero(&self) -> Datum {
        match self {
            DataType::Integer => Datum::Integer(0),
            DataType::Real => Datum::Real(0.0),
            DataType::Boolean => Datum::Boolean(false),
            DataType::String => Datum::String(String::new()),
            DataType::Uuid => Datum::Uuid(Uuid::nil()),
        }
    }
}

/// A single typed column value, tagged by the owning column's `DataType`.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
}

impl Datum {
    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Integer(_) => DataType::Integer,
            Datum::Real(_) => DataType::Real,
            Datum::Boolean(_) => DataType::Boolean,
            Datum::String(_) => DataType::String,
            Datum::Uuid(_) => DataType::Uuid,
        }
    }

    /// Validate and convert a JSON value against a declared column type.
    pub fn from_json(value: &Json, ty: DataType, column: &str) -> Result<Self> {
        let bad = || {
            DbError::constraint(format!(
                "column '{}' expects a {} value, got {}",
                column,
                ty.name(),
                value
            ))
        };
        match ty {
            DataType::Integer => value.as_i64().map(Datum::Integer).ok_or_else(bad),
            DataType::Real => value.as_f64().map(Datum::Real).ok_or_else(bad),
            DataType::Boolean => value.as_bool().map(Datum::Boolean).ok_or_else(bad),
            DataType::String => value
                .as_str()
                .map(|s| Datum::String(s.to_string()))
                .ok_or_else(bad),
            DataType::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Datum::Uuid)
                .ok_or_else(bad),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Datum::Integer(i) => Json::from(*i),
            Datum::Real(f) => Json::from(*f),
            Datum::Boolean(b) => Json::from(*b),
            Datum::String(s) => Json::from(s.clone()),
            Datum::Uuid(u) => Json::from(u.to_string()),
        }
    }

    pub fn is_default(&self, ty: DataType) -> bool {
        *self == ty.zero()
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Integer(i) => write!(f, "{}", i),
            Datum::Real(r) => write!(f, "{}", r),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::String(s) => write!(f, "{}", s),
            Datum::Uuid(u) => write!(f, "{}", u),
        }
    }
}

/// One column's declaration within a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub ty_name: String,
    #[serde(default = "default_true")]
    pub persistent: bool,
    pub default: Option<Json>,
    /// Declaration order within the owning table; assigned, not stored.
    #[serde(skip)]
    pub index: usize,
}

fn default_true() -> bool {
    true
}

impl ColumnSchema {
    pub fn data_type(&self) -> Result<DataType> {
        DataType::from_name(&self.ty_name)
    }

    pub fn default_datum(&self) -> Result<Datum> {
        let ty = self.data_type()?;
        match &self.default {
            Some(v) => Datum::from_json(v, ty, &self.name),
            None => Ok(ty.zero()),
        }
    }
}

/// A table's column layout.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn find_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One row's datums, keyed by column name, plus its identity.
#[derive(Debug, Clone)]
pub struct Row {
    pub uuid: Uuid,
    pub values: BTreeMap<String, Datum>,
}

impl Row {
    pub fn new(uuid: Uuid) -> Self {
        Row {
            uuid,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.values.get(column)
    }
}
