//! Row-level identifiers and patch shapes.

use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::{
    RowKey,
    SchemaName,
    TableName,
    TransformationHash,
};

/// `(schema, table, rowKey)`. `rowKey` is the row's union key — the
/// union of all unique-index column sets for the table — not
/// necessarily its primary key, so that a primary-key migration can't
/// orphan an in-flight delete patch.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub schema: SchemaName,
    pub table: TableName,
    pub row_key: RowKey,
}

impl RowId {
    pub fn new(
        schema: impl Into<SchemaName>,
        table: impl Into<TableName>,
        row_key: impl Into<RowKey>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            row_key: row_key.into(),
        }
    }
}

/// A row reference's server-side bookkeeping: the version at which its
/// current contents were last observed, and how many live queries
/// currently reference it. `refCounts.values().sum() == 0` marks the
/// row a tombstone pending a delete patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRefs {
    pub ref_counts: BTreeMap<TransformationHash, i64>,
}

impl RowRefs {
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.values().all(|&c| c == 0)
    }

    pub fn adjust(&mut self, hash: &TransformationHash, delta: i64) {
        let entry = self.ref_counts.entry(hash.clone()).or_insert(0);
        *entry += delta;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowPatchOp {
    Put,
    Del,
}

/// One row mutation destined for a client's `rowsPatch`. `value` is
/// opaque JSON (the server never interprets row contents beyond the
/// `bigint`-safety check in the poke layer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowPatch {
    pub op: RowPatchOp,
    pub table_name: TableName,
    /// Present for `Put`, the row's current contents; for `Del`, only
    /// the row's key is needed so it is carried in `id`.
    pub value: Option<serde_json::Value>,
    pub id: serde_json::Value,
}
