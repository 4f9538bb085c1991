//! Snapshotter.

use std::collections::BTreeMap;

use errors::ResetPipelinesSignal;
use types::{
    RowKey,
    StateVersion,
    TableName,
};

use crate::{
    replica::Replica,
    snapshot::{
        Snapshot,
        TableSpecs,
    },
};

/// One row-level change between two consecutive snapshots. Both
/// `prev_value`/`next_value` being `None` is illegal.
#[derive(Clone, Debug)]
pub struct DiffRecord {
    pub table: TableName,
    pub row_key: RowKey,
    pub prev_value: Option<serde_json::Value>,
    pub next_value: Option<serde_json::Value>,
}

pub struct SnapshotDiff {
    pub records: Vec<DiffRecord>,
}

pub struct Snapshotter {
    replica: Replica,
    current: Snapshot,
    table_specs: TableSpecs,
}

impl Snapshotter {
    /// Take the current snapshot as the starting point for diffing.
    pub fn init(replica: Replica) -> (Self, StateVersion) {
        let current = replica.snapshot();
        let version = current.state_version.clone();
        let table_specs = replica.table_specs();
        (
            Self {
                replica,
                current,
                table_specs,
            },
            version,
        )
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    /// Advance to the latest replica snapshot, computing a row-level
    /// diff. Fails with `ResetPipelinesSignal` if the live replica's
    /// table specs are no longer compatible with the ones pipelines
    /// were built against.
    pub fn advance(&mut self, table_specs: &TableSpecs) -> Result<SnapshotDiff, ResetPipelinesSignal> {
        let live_specs = self.replica.table_specs();
        for (table, spec) in table_specs {
            match live_specs.get(table) {
                Some(live) if live == spec => {},
                Some(live) => {
                    return Err(ResetPipelinesSignal(format!(
                        "table {table} key shape changed from {:?} to {:?}",
                        spec.primary_key_columns, live.primary_key_columns
                    )));
                },
                None => {
                    return Err(ResetPipelinesSignal(format!("table {table} no longer exists")));
                },
            }
        }

        let next = self.replica.snapshot();
        let mut records = Vec::new();
        let mut tables: BTreeMap<&TableName, ()> = BTreeMap::new();
        for t in self.current.tables.keys().chain(next.tables.keys()) {
            tables.insert(t, ());
        }
        for table in tables.keys() {
            let prev_rows = self.current.tables.get(*table);
            let next_rows = next.tables.get(*table);
            let mut keys: BTreeMap<&RowKey, ()> = BTreeMap::new();
            if let Some(r) = prev_rows {
                for k in r.keys() {
                    keys.insert(k, ());
                }
            }
            if let Some(r) = next_rows {
                for k in r.keys() {
                    keys.insert(k, ());
                }
            }
            for key in keys.keys() {
                let prev_value = prev_rows.and_then(|r| r.get(*key)).cloned();
                let next_value = next_rows.and_then(|r| r.get(*key)).cloned();
                if prev_value == next_value {
                    continue;
                }
                records.push(DiffRecord {
                    table: (*table).clone(),
                    row_key: (*key).clone(),
                    prev_value,
                    next_value,
                });
            }
        }

        self.current = next;
        self.table_specs = table_specs.clone();
        Ok(SnapshotDiff { records })
    }

    /// Fast-forward without computing a diff, used when no pipelines
    /// have been hydrated yet.
    pub fn advance_without_diff(&mut self) {
        self.current = self.replica.snapshot();
        self.table_specs = self.replica.table_specs();
    }

    pub fn destroy(self) {}
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use types::StateVersion;

    use super::*;
    use crate::snapshot::TableSpec;

    fn specs() -> TableSpecs {
        let mut m = TableSpecs::new();
        m.insert(
            TableName::from("issues"),
            TableSpec {
                table: TableName::from("issues"),
                primary_key_columns: vec!["id".into()],
                union_key_columns: vec!["id".into()],
            },
        );
        m
    }

    #[test]
    fn advance_reports_put_and_delete_diffs() {
        let replica = Replica::new(StateVersion::new("00"), specs());
        replica.commit(
            StateVersion::new("01"),
            crate::replica::Commit::default()
                .put("issues", "1", json!({"id": 1, "title": "a"}))
                .put("issues", "2", json!({"id": 2, "title": "b"})),
        );
        let (mut snapshotter, _) = Snapshotter::init(replica.clone());

        replica.commit(
            StateVersion::new("02"),
            crate::replica::Commit::default()
                .put("issues", "1", json!({"id": 1, "title": "new title"}))
                .delete("issues", "2"),
        );
        let diff = snapshotter.advance(&specs()).unwrap();
        assert_eq!(diff.records.len(), 2);
        let by_key: BTreeMap<_, _> = diff
            .records
            .iter()
            .map(|r| (r.row_key.as_str().to_owned(), r))
            .collect();
        assert_eq!(
            by_key["1"].next_value,
            Some(json!({"id": 1, "title": "new title"}))
        );
        assert_eq!(by_key["2"].next_value, None);
    }

    #[test]
    fn schema_incompatible_change_signals_reset() {
        let replica = Replica::new(StateVersion::new("00"), specs());
        let (mut snapshotter, _) = Snapshotter::init(replica.clone());
        let mut changed = specs();
        changed.get_mut(&TableName::from("issues")).unwrap().primary_key_columns =
            vec!["uuid".into()];
        replica.set_table_specs(changed.clone());
        replica.commit(StateVersion::new("01"), crate::replica::Commit::default());
        assert!(snapshotter.advance(&specs()).is_err());
    }
}
