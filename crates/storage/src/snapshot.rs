//! A point-in-time, copy-on-write view of the replica. Holds an
//! `imbl::OrdMap` per table so that taking a new snapshot is O(1) and
//! old ones stay valid for in-flight readers.

use std::collections::BTreeMap;

use imbl::OrdMap;
use serde_json::Value as Row;
use types::{
    RowKey,
    StateVersion,
    TableName,
};

/// A table's declared key shape: the primary key (used to address
/// individual rows) and the union key (union of all unique-index
/// column sets, used so patches survive primary-key migrations).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub table: TableName,
    pub primary_key_columns: Vec<String>,
    pub union_key_columns: Vec<String>,
}

pub type TableSpecs = BTreeMap<TableName, TableSpec>;

#[derive(Clone)]
pub struct Snapshot {
    pub state_version: StateVersion,
    pub tables: BTreeMap<TableName, OrdMap<RowKey, Row>>,
}

impl Snapshot {
    pub fn empty(state_version: StateVersion) -> Self {
        Self {
            state_version,
            tables: BTreeMap::new(),
        }
    }

    pub fn get_row(&self, table: &TableName, key: &RowKey) -> Option<Row> {
        self.tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    /// Ordered fetch of every row in a table.
    pub fn fetch(&self, table: &TableName) -> impl Iterator<Item = (RowKey, Row)> + '_ {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}
