//! CVR data model.

use std::collections::BTreeMap;

use types::{
    ClientId,
    ClientQueryState,
    QueryRecord,
    RowId,
    RowRefs,
    StateVersion,
    TransformationHash,
    CVRVersion,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowRecord {
    pub row_version: CVRVersion,
    pub refs: RowRefs,
}

/// A full in-memory view of one client-group's CVR, as returned by
/// `CvrStore::load`.
#[derive(Clone, Debug)]
pub struct CvrSnapshot {
    pub client_group_id: types::ClientGroupId,
    pub version: CVRVersion,
    pub replica_version: Option<StateVersion>,
    pub owner: String,
    pub owner_takeover_time_ms: i64,
    pub client_schema: Option<serde_json::Value>,
    /// `clientID -> deleted`.
    pub clients: BTreeMap<ClientId, bool>,
    /// Queries keyed by transformation hash — the CVR's own record of
    /// `(ast, transformationHash, internal, deleted)`.
    pub queries: BTreeMap<TransformationHash, QueryRecord>,
    /// Per-client desired-query state, `desires(clientID, queryHash)`.
    pub desires: BTreeMap<(ClientId, TransformationHash), ClientQueryState>,
    pub rows: BTreeMap<RowId, RowRecord>,
}

impl CvrSnapshot {
    pub fn empty(client_group_id: types::ClientGroupId, owner: String) -> Self {
        Self {
            client_group_id,
            version: CVRVersion::empty(),
            replica_version: None,
            owner,
            owner_takeover_time_ms: 0,
            client_schema: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            desires: BTreeMap::new(),
            rows: BTreeMap::new(),
        }
    }

    /// Every hash with at least one non-deleted desire and not itself
    /// expired, i.e. the set the Pipeline Driver must be reconciled
    /// against. Internal queries are always included.
    pub fn desired_queries(&self, now_ms: i64) -> Vec<(TransformationHash, bool)> {
        let mut expired_by_hash: BTreeMap<&TransformationHash, bool> = BTreeMap::new();
        for ((_, hash), state) in &self.desires {
            let entry = expired_by_hash.entry(hash).or_insert(true);
            *entry &= state.is_expired(now_ms);
        }
        self.queries
            .iter()
            .map(|(hash, record)| {
                let expired = if record.is_internal() {
                    false
                } else {
                    expired_by_hash.get(hash).copied().unwrap_or(true)
                };
                (hash.clone(), expired)
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
