//! CVR updaters.
//!
//! Both updaters work against a private `draft` clone of the CVR
//! snapshot taken at construction time; `flush` performs an optimistic
//! compare-and-swap against the store's live version, returning
//! `FlushConflict` if another updater flushed first in the meantime.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use errors::FlushConflict;
use types::{
    ClientId,
    ClientQueryState,
    QueryKind,
    QueryRecord,
    RowId,
    StateVersion,
    TransformationHash,
    CVRVersion,
};

use crate::{
    model::{
        CvrSnapshot,
        RowRecord,
    },
    patch::{
        DesiredQueryPatch,
        PatchOp,
        QueryPatch,
        QueryPatches,
        ReceivedRowChange,
        RowPatch,
        TrackedQueryAst,
    },
    store::{
        InMemoryCvrStore,
        PendingLog,
    },
};

/// Accumulates CVR-only mutations (adding/removing desired queries,
/// deleting clients) that happen between replication commits. Bumps
/// only the minor version.
pub struct CVRConfigDrivenUpdater {
    base_version: CVRVersion,
    draft: CvrSnapshot,
    log: PendingLog,
}

impl CVRConfigDrivenUpdater {
    pub fn new(base: CvrSnapshot) -> Self {
        Self {
            base_version: base.version.clone(),
            draft: base,
            log: PendingLog::default(),
        }
    }

    /// Apply a client's desired-query patch set, returning the
    /// `desiredQueriesPatches` entries a poke should carry.
    pub fn put_desired_queries(
        &mut self,
        client_id: &ClientId,
        puts: Vec<(TransformationHash, TrackedQueryAst, Option<i64>)>,
        dels: Vec<TransformationHash>,
        now_ms: i64,
    ) -> Vec<DesiredQueryPatch> {
        let mut patches = Vec::new();
        self.draft.clients.entry(client_id.clone()).or_insert(false);
        for (hash, ast, ttl_ms) in puts {
            self.draft.queries.entry(hash.clone()).or_insert_with(|| QueryRecord {
                ast,
                kind: QueryKind::Client,
                transformation_hash: Some(hash.clone()),
            });
            let version = self.draft.desires.len() as u64;
            self.draft
                .desires
                .entry((client_id.clone(), hash.clone()))
                .and_modify(|s| {
                    s.inactivated_at_ms = None;
                    s.ttl_ms = ttl_ms;
                })
                .or_insert(ClientQueryState {
                    version,
                    ttl_ms,
                    inactivated_at_ms: None,
                });
            let patch = DesiredQueryPatch {
                client_id: client_id.clone(),
                op: PatchOp::Put,
                hash,
            };
            self.log.push_desired(patch.clone());
            patches.push(patch);
        }
        for hash in dels {
            if let Some(state) = self.draft.desires.get_mut(&(client_id.clone(), hash.clone())) {
                state.inactivate(now_ms);
            }
            let patch = DesiredQueryPatch {
                client_id: client_id.clone(),
                op: PatchOp::Del,
                hash,
            };
            self.log.push_desired(patch.clone());
            patches.push(patch);
        }
        self.draft.version = self.draft.version.next_minor();
        patches
    }

    pub fn new_version(&self) -> &CVRVersion {
        &self.draft.version
    }

    /// Commit the draft back to the store if its base version is still
    /// current.
    pub fn flush(self, store: &InMemoryCvrStore) -> Result<CvrSnapshot, FlushConflict> {
        store.compare_and_swap_logged(&self.base_version, self.draft, self.log)
    }
}

/// Accumulates row-hydration/advancement mutations: new/removed
/// queries, batched row refcount updates, and unreferenced-row
/// deletion. Drives the new major/minor CVR version for a single
/// query-set reconciliation or pipeline-advancement pass.
pub struct CVRQueryDrivenUpdater {
    base_version: CVRVersion,
    draft: CvrSnapshot,
    unreferenced_candidates: BTreeSet<RowId>,
    log: PendingLog,
}

impl CVRQueryDrivenUpdater {
    pub fn new(base: CvrSnapshot) -> Self {
        Self {
            base_version: base.version.clone(),
            unreferenced_candidates: BTreeSet::new(),
            draft: base,
            log: PendingLog::default(),
        }
    }

    /// Register a query-set transition: records which hashes are
    /// newly tracked and which are dropped, advancing to a fresh
    /// state version.
    pub fn track_queries(
        &mut self,
        new_state_version: Option<StateVersion>,
        add: &[(TransformationHash, TrackedQueryAst, bool)],
        remove: &[TransformationHash],
    ) -> QueryPatches {
        let mut patches = QueryPatches::default();
        for (hash, ast, internal) in add {
            self.draft.queries.entry(hash.clone()).or_insert_with(|| QueryRecord {
                ast: ast.clone(),
                kind: if *internal { QueryKind::Internal } else { QueryKind::Client },
                transformation_hash: Some(hash.clone()),
            });
            let patch = QueryPatch {
                op: PatchOp::Put,
                hash: hash.clone(),
            };
            self.log.push_query(patch.clone());
            patches.got.push(patch);
        }
        for hash in remove {
            self.draft.queries.remove(hash);
            let affected: Vec<_> = self
                .draft
                .desires
                .keys()
                .filter(|(_, h)| h == hash)
                .cloned()
                .collect();
            for key in affected {
                self.draft.desires.remove(&key);
            }
            for (row_id, record) in self.draft.rows.iter_mut() {
                if record.refs.ref_counts.remove(hash).is_some() {
                    self.unreferenced_candidates.insert(row_id.clone());
                }
            }
            let patch = QueryPatch {
                op: PatchOp::Del,
                hash: hash.clone(),
            };
            self.log.push_query(patch.clone());
            patches.got.push(patch);
        }
        self.draft.version = match new_state_version {
            Some(sv) if sv > self.draft.version.state_version => {
                self.draft.replica_version = Some(sv.clone());
                CVRVersion::at_state(sv)
            },
            _ => self.draft.version.next_minor(),
        };
        patches
    }

    /// Batch of row-level observations surfaced while hydrating/
    /// advancing pipelines. Overwrites `version`/`contents` on repeat
    /// keys within the batch (last-writer-wins for intermediate IVM
    /// edits), adjusts refcounts, and returns the set of row ids whose
    /// visible contents changed.
    pub fn received(&mut self, batch: BTreeMap<RowId, ReceivedRowChange>) -> Vec<RowPatch> {
        let mut out = Vec::with_capacity(batch.len());
        for (row_id, change) in batch {
            let record = self.draft.rows.entry(row_id.clone()).or_insert_with(|| RowRecord {
                row_version: self.draft.version.clone(),
                refs: Default::default(),
            });
            record.refs.adjust(&change.hash, change.delta);
            record.row_version = self.draft.version.clone();
            let still_referenced = !record.refs.is_tombstone();
            if !still_referenced {
                self.unreferenced_candidates.insert(row_id.clone());
            }
            self.log.push_row(row_id.clone(), change.contents);
            out.push(RowPatch {
                row_id,
                still_referenced,
            });
        }
        out
    }

    /// Emit delete patches for every row whose refcount has dropped to
    /// zero across every tracked hash, and purge them from the draft.
    pub fn delete_unreferenced_rows(&mut self) -> Vec<RowId> {
        let mut deleted = Vec::new();
        for row_id in std::mem::take(&mut self.unreferenced_candidates) {
            if let Some(record) = self.draft.rows.get(&row_id) {
                if record.refs.is_tombstone() {
                    self.draft.rows.remove(&row_id);
                    self.log.push_row(row_id.clone(), None);
                    deleted.push(row_id);
                }
            }
        }
        deleted
    }

    pub fn new_version(&self) -> &CVRVersion {
        &self.draft.version
    }

    pub fn flush(self, store: &InMemoryCvrStore) -> Result<CvrSnapshot, FlushConflict> {
        store.compare_and_swap_logged(&self.base_version, self.draft, self.log)
    }
}
