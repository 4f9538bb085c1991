//! Config and row patches produced by CVR updaters.

use types::{
    ClientId,
    QueryAst,
    RowId,
    TransformationHash,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOp {
    Put,
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPatch {
    pub op: PatchOp,
    pub hash: TransformationHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredQueryPatch {
    pub client_id: ClientId,
    pub op: PatchOp,
    pub hash: TransformationHash,
}

#[derive(Clone, Debug, Default)]
pub struct QueryPatches {
    /// `got` patches — hydrated/unhydrated pipelines.
    pub got: Vec<QueryPatch>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RowPatch {
    pub row_id: RowId,
    /// `false` means the row is now a full tombstone (all refcounts
    /// zero): the caller should emit a `del` patch.
    pub still_referenced: bool,
}

/// A caller-supplied row change destined for CVR bookkeeping: which
/// query hash observed it and how its refcount should move
/// (`add` -> +1, `remove` -> -1, `edit` -> no change).
#[derive(Clone, Debug)]
pub struct ReceivedRowChange {
    pub row_id: RowId,
    pub hash: TransformationHash,
    pub delta: i64,
    pub contents: Option<serde_json::Value>,
}

// Re-exported for callers who only need the AST shape alongside a
// tracked-query request.
pub type TrackedQueryAst = QueryAst;
