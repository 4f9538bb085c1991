//! Stand-in for the external replicator. Real
//! deployments would have a change-streamer writing into an actual
//! replicated Postgres/SQLite replica; here `Replica` is the minimal
//! read/write surface the Snapshotter needs, so the View Syncer and its
//! tests can run against an in-memory stand-in.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use parking_lot::RwLock;
use serde_json::Value as Row;
use types::{
    RowKey,
    StateVersion,
    TableName,
};

use crate::snapshot::{
    Snapshot,
    TableSpecs,
};

#[derive(Clone, Debug)]
pub enum RowWrite {
    Put(Row),
    Delete,
}

/// One upstream commit: a watermark plus the rows it touched.
#[derive(Clone, Debug, Default)]
pub struct Commit {
    pub writes: BTreeMap<TableName, BTreeMap<RowKey, RowWrite>>,
}

impl Commit {
    pub fn put(mut self, table: impl Into<TableName>, key: impl Into<RowKey>, row: Row) -> Self {
        self.writes
            .entry(table.into())
            .or_default()
            .insert(key.into(), RowWrite::Put(row));
        self
    }

    pub fn delete(mut self, table: impl Into<TableName>, key: impl Into<RowKey>) -> Self {
        self.writes
            .entry(table.into())
            .or_default()
            .insert(key.into(), RowWrite::Delete);
        self
    }
}

struct ReplicaInner {
    version: StateVersion,
    snapshot: Snapshot,
    table_specs: TableSpecs,
}

/// Shared, lock-protected replica state. `commit` simulates the
/// replicator applying a new watermark; `snapshot` / `version` are read
/// by the Snapshotter under its own lock discipline.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<RwLock<ReplicaInner>>,
}

impl Replica {
    pub fn new(initial_version: StateVersion, table_specs: TableSpecs) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ReplicaInner {
                snapshot: Snapshot::empty(initial_version.clone()),
                version: initial_version,
                table_specs,
            })),
        }
    }

    pub fn version(&self) -> StateVersion {
        self.inner.read().version.clone()
    }

    pub fn table_specs(&self) -> TableSpecs {
        self.inner.read().table_specs.clone()
    }

    pub fn set_table_specs(&self, specs: TableSpecs) {
        self.inner.write().table_specs = specs;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().snapshot.clone()
    }

    /// Apply a commit at a new watermark. `new_version` must be
    /// strictly greater than the current one.
    pub fn commit(&self, new_version: StateVersion, commit: Commit) {
        let mut inner = self.inner.write();
        assert!(
            new_version > inner.version,
            "replica versions must advance monotonically"
        );
        for (table, rows) in commit.writes {
            let entry = inner.snapshot.tables.entry(table).or_default();
            for (key, write) in rows {
                match write {
                    RowWrite::Put(row) => {
                        entry.insert(key, row);
                    },
                    RowWrite::Delete => {
                        entry.remove(&key);
                    },
                }
            }
        }
        inner.snapshot.state_version = new_version.clone();
        inner.version = new_version;
    }

    /// Replace every row of `table` with `rows` — the truncate/DDL
    /// path used by `Snapshotter::advance` to detect schema resets in
    /// tests.
    pub fn truncate(&self, new_version: StateVersion, table: &TableName) {
        let mut inner = self.inner.write();
        assert!(new_version > inner.version);
        if let Some(rows) = inner.snapshot.tables.get_mut(table) {
            rows.clear();
        }
        inner.snapshot.state_version = new_version.clone();
        inner.version = new_version;
    }
}
