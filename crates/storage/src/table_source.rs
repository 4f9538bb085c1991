//! Table Source: an ordered per-table view over the current
//! snapshot that pushes row changes into downstream IVM operators.

use types::RowKey;

use crate::snapshot::Snapshot;

#[derive(Clone, Debug, PartialEq)]
pub enum RowChangeKind {
    Add,
    Remove,
    Edit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceChange {
    pub kind: RowChangeKind,
    pub row_key: RowKey,
    pub row: Option<serde_json::Value>,
    pub old_row: Option<serde_json::Value>,
}

/// Receives pushed row changes from a `TableSource`. The IVM operator
/// graph implements this; here it is a trait object so the storage
/// layer stays ignorant of pipeline internals.
pub trait ChangeSink {
    fn push(&mut self, change: SourceChange);
}

pub struct TableSource {
    pub table: types::TableName,
    snapshot: Snapshot,
}

impl TableSource {
    pub fn new(table: types::TableName, snapshot: Snapshot) -> Self {
        Self { table, snapshot }
    }

    /// Rebind to a newer snapshot between advancement batches.
    pub fn set_db(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }

    pub fn get_row(&self, key: &RowKey) -> Option<serde_json::Value> {
        self.snapshot.get_row(&self.table, key)
    }

    /// Ordered fetch of every row currently in the table, keyed
    /// ascending by primary key.
    pub fn fetch(&self) -> impl Iterator<Item = (RowKey, serde_json::Value)> + '_ {
        self.snapshot.fetch(&self.table)
    }

    /// Push a prev/next diff record for this table's key into a sink,
    /// translating it into the `add`/`remove`/`edit` shape IVM
    /// operators expect.
    pub fn push_diff(
        &self,
        sink: &mut dyn ChangeSink,
        row_key: RowKey,
        prev_value: Option<serde_json::Value>,
        next_value: Option<serde_json::Value>,
    ) {
        let change = match (prev_value, next_value) {
            (None, Some(next)) => SourceChange {
                kind: RowChangeKind::Add,
                row_key,
                row: Some(next),
                old_row: None,
            },
            (Some(prev), None) => SourceChange {
                kind: RowChangeKind::Remove,
                row_key,
                row: None,
                old_row: Some(prev),
            },
            (Some(prev), Some(next)) => SourceChange {
                kind: RowChangeKind::Edit,
                row_key,
                row: Some(next),
                old_row: Some(prev),
            },
            (None, None) => panic!("both-null diff record is illegal"),
        };
        sink.push(change);
    }
}
