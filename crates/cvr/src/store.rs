//! CVR Store contract and an in-memory reference
//! implementation.
//!
//! Optimistic-concurrency commit: a writer reads a base version,
//! builds a draft, and the store accepts the write only if that base
//! version is still current — otherwise the writer's work is
//! discarded and the conflict is reported upward. Here a CVR flush
//! conflict is fatal to the View Syncer that loses the race.

use async_trait::async_trait;
use errors::{
    FlushConflict,
    OwnershipLost,
};
use parking_lot::Mutex;
use types::{
    ClientId,
    RowId,
    TransformationHash,
    CVRVersion,
};

use crate::{
    model::CvrSnapshot,
    patch::{
        DesiredQueryPatch,
        QueryPatch,
    },
};

/// One entry in a CVR's append-only patch log, tagged with the version
/// at which it took effect. `catchup_row_patches`/`catchup_config_patches`
/// replay these to bring a reconnecting client's cookie forward without
/// re-hydrating.
#[derive(Clone, Debug)]
pub enum CvrLogEntry {
    Row {
        row_id: RowId,
        contents: Option<serde_json::Value>,
    },
    Query(QueryPatch),
    Desired(DesiredQueryPatch),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PendingLog {
    pub entries: Vec<CvrLogEntry>,
}

impl PendingLog {
    pub fn push_row(&mut self, row_id: RowId, contents: Option<serde_json::Value>) {
        self.entries.push(CvrLogEntry::Row { row_id, contents });
    }

    pub fn push_query(&mut self, patch: QueryPatch) {
        self.entries.push(CvrLogEntry::Query(patch));
    }

    pub fn push_desired(&mut self, patch: DesiredQueryPatch) {
        self.entries.push(CvrLogEntry::Desired(patch));
    }
}

/// Abstract persistence contract for a client group's CVR, with the
/// backing store left unspecified; `InMemoryCvrStore` is the
/// reference implementation this workspace exercises end to end.
#[async_trait]
pub trait CvrStore: Send + Sync {
    /// Load the CVR as of `owner`'s view at `as_of_ms`, also performing
    /// an ownership takeover: if the CVR's current owner differs from
    /// `owner`, this instance is claiming it. That succeeds — and
    /// overwrites the stale owner — unless `as_of_ms` is itself older
    /// than the current owner's takeover, in which case a newer
    /// instance has already taken over and this one has lost the race.
    async fn load(&self, owner: &str, as_of_ms: i64) -> anyhow::Result<CvrSnapshot>;

    /// The version most recently accepted by `compare_and_swap`, for
    /// callers that only need a cheap liveness check.
    fn flushed_version(&self) -> CVRVersion;

    async fn catchup_row_patches(
        &self,
        since: &CVRVersion,
    ) -> anyhow::Result<Vec<(CVRVersion, RowId, Option<serde_json::Value>)>>;

    async fn catchup_config_patches(
        &self,
        since: &CVRVersion,
    ) -> anyhow::Result<Vec<(CVRVersion, QueryPatch)>>;

    async fn catchup_desired_patches(
        &self,
        since: &CVRVersion,
        client_id: &ClientId,
    ) -> anyhow::Result<Vec<(CVRVersion, DesiredQueryPatch)>>;

    /// Debug/`inspect` surface: every tracked query hash and whether it
    /// currently reads as expired.
    async fn inspect_queries(&self, now_ms: i64) -> anyhow::Result<Vec<(TransformationHash, bool)>>;

    fn row_count(&self) -> usize;
}

struct Inner {
    snapshot: CvrSnapshot,
    row_log: Vec<(CVRVersion, RowId, Option<serde_json::Value>)>,
    query_log: Vec<(CVRVersion, QueryPatch)>,
    desired_log: Vec<(CVRVersion, DesiredQueryPatch)>,
}

/// Reference `CvrStore` backed by an in-process mutex. Suitable for
/// tests and single-process deployments; a real deployment would swap
/// this for a durable table-backed store without changing the updater
/// contract.
pub struct InMemoryCvrStore {
    inner: Mutex<Inner>,
}

impl InMemoryCvrStore {
    pub fn new(initial: CvrSnapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: initial,
                row_log: Vec::new(),
                query_log: Vec::new(),
                desired_log: Vec::new(),
            }),
        }
    }

    pub fn empty(client_group_id: types::ClientGroupId, owner: String) -> Self {
        Self::new(CvrSnapshot::empty(client_group_id, owner))
    }

    /// Accept `draft` as the new live snapshot iff `base_version` still
    /// matches the store's current version, appending `log` entries
    /// tagged with `draft.version`. Returns the accepted snapshot.
    pub(crate) fn compare_and_swap_logged(
        &self,
        base_version: &CVRVersion,
        draft: CvrSnapshot,
        log: PendingLog,
    ) -> Result<CvrSnapshot, FlushConflict> {
        let mut inner = self.inner.lock();
        if &inner.snapshot.version != base_version {
            return Err(FlushConflict);
        }
        let new_version = draft.version.clone();
        for entry in log.entries {
            match entry {
                CvrLogEntry::Row { row_id, contents } => {
                    inner.row_log.push((new_version.clone(), row_id, contents));
                },
                CvrLogEntry::Query(patch) => {
                    inner.query_log.push((new_version.clone(), patch));
                },
                CvrLogEntry::Desired(patch) => {
                    inner.desired_log.push((new_version.clone(), patch));
                },
            }
        }
        inner.snapshot = draft.clone();
        Ok(draft)
    }

    /// Convenience for callers (e.g. `CVRConfigDrivenUpdater`) that
    /// never produce log entries of their own.
    pub fn compare_and_swap(
        &self,
        base_version: &CVRVersion,
        draft: CvrSnapshot,
    ) -> Result<CvrSnapshot, FlushConflict> {
        self.compare_and_swap_logged(base_version, draft, PendingLog::default())
    }
}

#[async_trait]
impl CvrStore for InMemoryCvrStore {
    async fn load(&self, owner: &str, as_of_ms: i64) -> anyhow::Result<CvrSnapshot> {
        let mut inner = self.inner.lock();
        if inner.snapshot.owner != owner {
            if as_of_ms < inner.snapshot.owner_takeover_time_ms {
                return Err(OwnershipLost {
                    takeover_time_ms: inner.snapshot.owner_takeover_time_ms,
                }
                .into());
            }
            inner.snapshot.owner = owner.to_string();
            inner.snapshot.owner_takeover_time_ms = as_of_ms;
        }
        Ok(inner.snapshot.clone())
    }

    fn flushed_version(&self) -> CVRVersion {
        self.inner.lock().snapshot.version.clone()
    }

    async fn catchup_row_patches(
        &self,
        since: &CVRVersion,
    ) -> anyhow::Result<Vec<(CVRVersion, RowId, Option<serde_json::Value>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .row_log
            .iter()
            .filter(|(v, _, _)| v > since)
            .cloned()
            .collect())
    }

    async fn catchup_config_patches(
        &self,
        since: &CVRVersion,
    ) -> anyhow::Result<Vec<(CVRVersion, QueryPatch)>> {
        let inner = self.inner.lock();
        Ok(inner
            .query_log
            .iter()
            .filter(|(v, _)| v > since)
            .cloned()
            .collect())
    }

    async fn catchup_desired_patches(
        &self,
        since: &CVRVersion,
        client_id: &ClientId,
    ) -> anyhow::Result<Vec<(CVRVersion, DesiredQueryPatch)>> {
        let inner = self.inner.lock();
        Ok(inner
            .desired_log
            .iter()
            .filter(|(v, patch)| v > since && &patch.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn inspect_queries(&self, now_ms: i64) -> anyhow::Result<Vec<(TransformationHash, bool)>> {
        Ok(self.inner.lock().snapshot.desired_queries(now_ms))
    }

    fn row_count(&self) -> usize {
        self.inner.lock().snapshot.row_count()
    }
}

#[cfg(test)]
mod tests {
    use types::ClientGroupId;

    use super::*;

    fn store() -> InMemoryCvrStore {
        InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string())
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_base() {
        let store = store();
        let base = store.load("owner-a", 0).await.unwrap();
        let mut draft = base.clone();
        draft.version = draft.version.next_minor();

        // Someone else flushes first.
        store.compare_and_swap(&base.version, draft.clone()).unwrap();

        // Our draft, built against the now-stale base, must be rejected.
        let mut stale_draft = base.clone();
        stale_draft.version = stale_draft.version.next_minor();
        let result = store.compare_and_swap(&base.version, stale_draft);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn catchup_row_patches_only_returns_entries_after_cutoff() {
        let store = store();
        let base = store.load("owner-a", 0).await.unwrap();
        let v1 = base.version.next_minor();

        let mut log = PendingLog::default();
        log.push_row(
            RowId::new("public", "issues", "row1"),
            Some(serde_json::json!({"id": "row1"})),
        );
        let mut draft = base.clone();
        draft.version = v1.clone();
        store
            .compare_and_swap_logged(&base.version, draft, log)
            .unwrap();

        let patches = store.catchup_row_patches(&base.version).await.unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, v1);

        let none = store.catchup_row_patches(&v1).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn inspect_queries_reports_expired_state() {
        let store = store();
        let queries = store.inspect_queries(0).await.unwrap();
        assert!(queries.is_empty());
    }

    #[tokio::test]
    async fn load_takes_over_from_a_stale_owner() {
        let store = store();
        let taken = store.load("owner-b", 1_000).await.unwrap();
        assert_eq!(taken.owner, "owner-b");
        assert_eq!(taken.owner_takeover_time_ms, 1_000);

        // A later load under the same owner is a no-op on ownership.
        let again = store.load("owner-b", 2_000).await.unwrap();
        assert_eq!(again.owner, "owner-b");
        assert_eq!(again.owner_takeover_time_ms, 1_000);
    }

    #[tokio::test]
    async fn load_fails_when_a_newer_owner_already_took_over() {
        let store = store();
        store.load("owner-b", 1_000).await.unwrap();

        // owner-c tries to claim it "as of" a point before owner-b's takeover.
        let err = store.load("owner-c", 500).await.unwrap_err();
        let lost = errors::is_ownership_lost(&err).expect("must be an OwnershipLost error");
        assert_eq!(lost.takeover_time_ms, 1_000);

        // The store's owner is unchanged by the rejected attempt.
        let current = store.load("owner-b", 1_500).await.unwrap();
        assert_eq!(current.owner, "owner-b");
    }
}
