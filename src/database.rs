//! The in-memory database image a `File` builds by replaying a log.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::schema::Schema;
use crate::types::Row;

/// All rows of one table, keyed by UUID.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub rows: BTreeMap<Uuid, Row>,
}

impl Table {
    pub fn get(&self, uuid: &Uuid) -> Option<&Row> {
        self.rows.get(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }
}

/// The image owns its tables and the schema they were built under.
#[derive(Debug, Clone)]
pub struct Database {
    pub schema: Schema,
    pub tables: BTreeMap<String, Table>,
}

impl Database {
    pub fn empty(schema: Schema) -> Self {
        let tables = schema
            .tables
            .keys()
            .map(|name| (name.clone(), Table::default()))
            .collect();
        Database { schema, tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }
}
