//! View Syncer Service: the per-client-group orchestrator. Drives a
//! main loop that validates and advances the CVR's view of a replica
//! against the set of queries clients currently desire, then pokes
//! the resulting patches out.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::{
        atomic::{
            AtomicI64,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};

use auth::{
    pick_token,
    Identity,
};
use cvr::{
    CVRQueryDrivenUpdater,
    CvrSnapshot,
    CvrStore,
    InMemoryCvrStore,
    ReceivedRowChange,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use pipeline::{
    Advancement,
    PipelineDriver,
    RowChange,
    RowChangeKind,
};
use types::{
    auth_contract::TokenData,
    ClientGroupId,
    ClientId,
    DesiredQueryPatch as WireDesiredQueryPatch,
    GotQueryPatch,
    QueryAst,
    QuerySetOp,
    RowId,
    RowPatchOp,
    SchemaVersion,
    SchemaVersionRange,
    TransformationHash,
    CVRVersion,
};

use crate::{
    config,
    drain::DrainCoordinator,
    lock::{
        AsyncLock,
        EvictionTimer,
    },
    metrics,
    poke::{
        ClientPoker,
        ClientSink,
        PokeHandler,
    },
};

/// The row schema namespace the View Syncer operates under; a
/// multi-schema replicator is out of scope, so a single
/// constant stands in for it.
const SCHEMA: &str = "public";

fn row_key_json(row_id: &RowId) -> serde_json::Value {
    serde_json::Value::String(row_id.row_key.as_str().to_string())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A process-unique id for this `ViewSyncerService` instance, used to
/// claim CVR ownership on load.
fn generate_owner_id() -> String {
    let seq = OWNER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), seq)
}

/// The internal query that tracks `lastMutationID` rows on a client
/// group's `.clients` shard table. Seeded once per group so every
/// connection's poke can carry `lastMutationIDChanges`; it never
/// expires or gets evicted since `QueryRecord::is_internal` is true.
fn internal_lmid_hash(client_group_id: &ClientGroupId) -> TransformationHash {
    TransformationHash::new(format!("__lmid__{}", client_group_id.as_str()))
}

fn internal_lmid_query_ast(client_group_id: &ClientGroupId) -> QueryAst {
    QueryAst(serde_json::json!({ "table": format!("{}_0.clients", client_group_id.as_str()) }))
}

fn into_wire_op(op: cvr::PatchOp) -> types::message::PatchOp {
    match op {
        cvr::PatchOp::Put => types::message::PatchOp::Put,
        cvr::PatchOp::Del => types::message::PatchOp::Del,
    }
}

fn into_wire_desired(patch: cvr::DesiredQueryPatch, cvr: &CvrSnapshot) -> WireDesiredQueryPatch {
    let ast = match patch.op {
        cvr::PatchOp::Put => cvr.queries.get(&patch.hash).map(|r| r.ast.clone()),
        cvr::PatchOp::Del => None,
    };
    let ttl_ms = cvr
        .desires
        .get(&(patch.client_id.clone(), patch.hash.clone()))
        .and_then(|s| s.ttl_ms);
    WireDesiredQueryPatch {
        op: into_wire_op(patch.op),
        hash: patch.hash,
        ast,
        ttl_ms,
    }
}

struct ClientRegistration {
    base_version: CVRVersion,
    schema_version: Option<SchemaVersion>,
    sink: Arc<dyn ClientSink>,
}

impl ClientRegistration {
    fn poker(&self, client_id: ClientId) -> ClientPoker {
        ClientPoker::new(client_id, self.base_version.clone(), self.schema_version, self.sink.clone())
    }
}

struct ServiceState {
    initialized: bool,
    pipelines_synced: bool,
    pipeline: PipelineDriver,
    cvr: CvrSnapshot,
    auth_data: Option<TokenData>,
    schema_versions: Option<SchemaVersionRange>,
    eviction_timer: EvictionTimer,
}

/// Per-client-group orchestrator. Exactly one instance
/// owns a `clientGroupID`'s CVR at a time; `lock` serializes every
/// stateful transition while `clients` is updated lock-free for fast
/// disconnect handling.
pub struct ViewSyncerService {
    client_group_id: ClientGroupId,
    owner_id: String,
    lock: AsyncLock<ServiceState>,
    clients: Mutex<BTreeMap<ClientId, ClientRegistration>>,
    keepalive_until_ms: AtomicI64,
    keepalive_ms: i64,
    max_row_count: usize,
    drain: Arc<DrainCoordinator>,
    cvr_store: Arc<InMemoryCvrStore>,
    eviction_notify: Arc<tokio::sync::Notify>,
}

impl ViewSyncerService {
    pub async fn new(
        client_group_id: ClientGroupId,
        replica: storage::Replica,
        cvr_store: Arc<InMemoryCvrStore>,
        max_row_count: usize,
        keepalive_ms: i64,
        drain: Arc<DrainCoordinator>,
    ) -> anyhow::Result<Arc<Self>> {
        let owner_id = generate_owner_id();
        let cvr = cvr_store.load(&owner_id, now_ms()).await?;
        let state = ServiceState {
            initialized: false,
            pipelines_synced: false,
            pipeline: PipelineDriver::new(replica),
            cvr,
            auth_data: None,
            schema_versions: None,
            eviction_timer: EvictionTimer::idle(),
        };
        Ok(Arc::new(Self {
            client_group_id,
            owner_id,
            lock: AsyncLock::new(state),
            clients: Mutex::new(BTreeMap::new()),
            keepalive_until_ms: AtomicI64::new(now_ms() + keepalive_ms),
            keepalive_ms,
            max_row_count,
            drain,
            cvr_store,
            eviction_notify: Arc::new(tokio::sync::Notify::new()),
        }))
    }

    pub async fn set_schema_versions(&self, versions: Option<SchemaVersionRange>) {
        self.lock.lock().await.schema_versions = versions;
    }

    pub fn keepalive(&self) {
        self.keepalive_until_ms
            .store(now_ms() + self.keepalive_ms, Ordering::SeqCst);
    }

    fn should_shutdown(&self) -> bool {
        if !self.clients.lock().is_empty() {
            return false;
        }
        now_ms() > self.keepalive_until_ms.load(Ordering::SeqCst)
    }

    // ---- Connection lifecycle ----------------------

    pub async fn init_connection(
        &self,
        client_id: ClientId,
        base_version: CVRVersion,
        schema_version: Option<SchemaVersion>,
        token: Option<TokenData>,
        desired_patch: Vec<QuerySetOp>,
        sink: Arc<dyn ClientSink>,
    ) -> anyhow::Result<()> {
        self.clients.lock().insert(
            client_id.clone(),
            ClientRegistration {
                base_version: base_version.clone(),
                schema_version,
                sink: sink.clone(),
            },
        );
        self.keepalive();

        let mut state = self.lock.lock().await;
        if base_version > state.cvr.version {
            self.clients.lock().remove(&client_id);
            let mut poker = ClientPoker::new(client_id, base_version, schema_version, sink);
            poker.fail(ErrorMetadata::invalid_base_cookie(
                "client's base cookie is ahead of the CVR's current version",
            ));
            return Ok(());
        }

        let previous = state.auth_data.clone().map(Identity::User).unwrap_or(Identity::Unknown);
        let presented = Identity::from_token(token);
        match pick_token(&previous, &presented) {
            Ok(Identity::User(data)) => state.auth_data = Some(data),
            Ok(Identity::Unknown) => state.auth_data = None,
            Err(err) => {
                self.clients.lock().remove(&client_id);
                let mut poker = ClientPoker::new(client_id, base_version, schema_version, sink);
                poker.fail(err);
                return Ok(());
            },
        }

        let (puts, dels) = resolve_query_ops(&state.cvr, &client_id, desired_patch);
        if puts.is_empty() && dels.is_empty() {
            return Ok(());
        }
        let mut updater = cvr::CVRConfigDrivenUpdater::new(state.cvr.clone());
        let patches = updater.put_desired_queries(&client_id, puts, dels, now_ms());
        let new_version = updater.new_version().clone();
        let flushed = updater
            .flush(&self.cvr_store)
            .map_err(|_| anyhow::Error::new(errors::FlushConflict))?;
        state.cvr = flushed;

        let poker = self.clients.lock().get(&client_id).map(|r| r.poker(client_id.clone()));
        if let Some(poker) = poker {
            let mut handler = PokeHandler::start_poke(vec![poker], new_version.clone(), state.schema_versions);
            for patch in patches {
                let wire = into_wire_desired(patch, &state.cvr);
                handler.push_desired(&client_id, wire, &new_version);
            }
            handler.end(&new_version);
        }
        self.eviction_notify.notify_one();
        Ok(())
    }

    pub async fn change_desired_queries(&self, client_id: ClientId, patch: Vec<QuerySetOp>) -> anyhow::Result<()> {
        let mut state = self.lock.lock().await;
        let (puts, dels) = resolve_query_ops(&state.cvr, &client_id, patch);
        if puts.is_empty() && dels.is_empty() {
            return Ok(());
        }
        let mut updater = cvr::CVRConfigDrivenUpdater::new(state.cvr.clone());
        let patches = updater.put_desired_queries(&client_id, puts, dels, now_ms());
        let new_version = updater.new_version().clone();
        let flushed = updater
            .flush(&self.cvr_store)
            .map_err(|_| anyhow::Error::new(errors::FlushConflict))?;
        state.cvr = flushed;
        let pokers = self.snapshot_pokers();
        let mut handler = PokeHandler::start_poke(pokers, new_version.clone(), state.schema_versions);
        for patch in patches {
            let wire = into_wire_desired(patch, &state.cvr);
            handler.push_desired(&client_id, wire, &new_version);
        }
        handler.end(&new_version);
        self.eviction_notify.notify_one();
        Ok(())
    }

    pub fn close_connection(&self, client_id: &ClientId) {
        self.clients.lock().remove(client_id);
    }

    pub fn delete_clients(&self, client_ids: Vec<ClientId>) {
        let mut clients = self.clients.lock();
        for id in client_ids {
            clients.remove(&id);
        }
    }

    fn snapshot_pokers(&self) -> Vec<ClientPoker> {
        self.clients
            .lock()
            .iter()
            .map(|(id, reg)| reg.poker(id.clone()))
            .collect()
    }

    fn clients_behind(&self, version: &CVRVersion) -> Vec<ClientPoker> {
        self.clients
            .lock()
            .iter()
            .filter(|(_, reg)| &reg.base_version < version)
            .map(|(id, reg)| reg.poker(id.clone()))
            .collect()
    }

    fn fail_all_clients(&self, err: ErrorMetadata) {
        let clients = self.clients.lock();
        for (id, reg) in clients.iter() {
            let mut poker = reg.poker(id.clone());
            poker.fail(err.clone());
        }
    }

    // ---- Main loop -------------------------------------

    pub async fn run(self: &Arc<Self>, mut version_ready: tokio::sync::mpsc::UnboundedReceiver<()>) {
        loop {
            tokio::select! {
                signal = version_ready.recv() => {
                    match signal {
                        Some(()) => {
                            let tick_now = now_ms();
                            if self.drain.should_drain(tick_now) {
                                let hydration_ms = {
                                    let state = self.lock.lock().await;
                                    state.pipeline.total_hydration_time_ms() as i64
                                };
                                self.drain.drain_next_in(tick_now, hydration_ms);
                                tracing::info!(client_group_id = %self.client_group_id, "draining");
                                break;
                            }
                            if let Err(err) = self.on_version_ready(tick_now).await {
                                tracing::error!(client_group_id = %self.client_group_id, error = %err, "fatal error, tearing down service");
                                self.fail_all_clients(ErrorMetadata::client_not_found(err.to_string()));
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = self.eviction_notify.notified() => {
                    let mut state = self.lock.lock().await;
                    if let Err(err) = self.evict_inactive_queries(&mut state).await {
                        tracing::warn!(error = %err, "eviction pass failed");
                    }
                }
            }
            if self.should_shutdown() {
                tracing::info!(client_group_id = %self.client_group_id, "shutting down idle view syncer");
                break;
            }
        }
    }

    async fn on_version_ready(&self, tick_now: i64) -> anyhow::Result<()> {
        let mut state = self.lock.lock().await;
        if !state.initialized {
            state.pipeline.init();
            state.initialized = true;
        }
        if let Some(replica_version) = state.cvr.replica_version.clone() {
            if &replica_version > state.pipeline.replica_version() {
                self.fail_all_clients(ErrorMetadata::client_not_found(
                    "cannot sync from a replica older than this CVR was built on",
                ));
                state.cvr = self.cvr_store.load(&self.owner_id, now_ms()).await?;
                return Ok(());
            }
        }

        if state.pipelines_synced {
            match state.pipeline.advance() {
                Ok(advancement) => self.advance_pipelines(&mut state, advancement).await?,
                Err(reset) => {
                    tracing::warn!(reason = %reset, "pipelines reset");
                    state.pipeline.reset();
                    state.pipelines_synced = false;
                },
            }
            return Ok(());
        }

        state.pipeline.advance_without_diff();
        if state.pipeline.current_version() < &state.cvr.version.state_version {
            return Ok(());
        }
        self.sync_query_pipeline_set(&mut state, tick_now).await?;
        state.pipelines_synced = true;
        self.evict_inactive_queries(&mut state).await?;
        Ok(())
    }

    /// Reconciles the hydrated pipeline set against what the CVR says
    /// every client currently desires.
    async fn sync_query_pipeline_set(&self, state: &mut ServiceState, tick_now: i64) -> anyhow::Result<()> {
        let desired = state.cvr.desired_queries(tick_now);
        let hydrated = state.pipeline.added_queries();

        let mut add = Vec::new();
        let mut remove = Vec::new();
        let mut keep = BTreeSet::new();

        let lmid_hash = internal_lmid_hash(&self.client_group_id);
        if !state.cvr.queries.contains_key(&lmid_hash) {
            add.push((lmid_hash, internal_lmid_query_ast(&self.client_group_id), true));
        }

        for (hash, expired) in &desired {
            if *expired {
                remove.push(hash.clone());
            } else if !hydrated.contains(hash) {
                let record = state.cvr.queries.get(hash).expect("desired hash must be a known query");
                add.push((hash.clone(), record.ast.clone(), record.is_internal()));
            } else {
                keep.insert(hash.clone());
            }
        }
        let unhydrate: Vec<TransformationHash> = hydrated
            .into_iter()
            .filter(|h| !keep.contains(h) && !add.iter().any(|(ah, ..)| ah == h))
            .collect();

        if !add.is_empty() || !remove.is_empty() || !unhydrate.is_empty() {
            self.add_and_remove_queries(state, add, remove, unhydrate).await
        } else {
            self.catchup_clients(state).await
        }
    }

    /// Hydrates newly desired queries, tears down dropped ones, and
    /// flushes the resulting CVR version as a single poke.
    async fn add_and_remove_queries(
        &self,
        state: &mut ServiceState,
        add: Vec<(TransformationHash, QueryAst, bool)>,
        remove: Vec<TransformationHash>,
        unhydrate: Vec<TransformationHash>,
    ) -> anyhow::Result<()> {
        let old_cvr_version = state.cvr.version.clone();
        let mut updater = CVRQueryDrivenUpdater::new(state.cvr.clone());
        let state_version = Some(state.pipeline.current_version().clone());
        let patches = updater.track_queries(state_version, &add, &remove);
        let new_version = updater.new_version().clone();

        let pokers = self.snapshot_pokers();
        let mut handler = PokeHandler::start_poke(pokers, new_version.clone(), state.schema_versions);
        for patch in patches.got {
            handler.push_got(GotQueryPatch { op: into_wire_op(patch.op), hash: patch.hash }, &new_version);
        }

        for hash in remove.iter().chain(unhydrate.iter()) {
            state.pipeline.remove_query(hash);
        }

        let mut hydrate_timer = metrics::hydrate_timer();
        let mut changes = Vec::new();
        for (hash, ast, _) in &add {
            match state.pipeline.add_query(hash.clone(), ast) {
                Ok(rows) => changes.extend(rows),
                Err(err) => {
                    hydrate_timer.set_status("error");
                    hydrate_timer.finish();
                    handler.cancel();
                    return Err(err);
                },
            }
        }
        hydrate_timer.finish();

        self.process_changes(&mut updater, &mut handler, changes, &new_version).await;
        for row_id in updater.delete_unreferenced_rows() {
            handler.push_row(&self.client_group_id, &row_id.table, RowPatchOp::Del, None, row_key_json(&row_id), &new_version);
        }

        let mut flush_timer = metrics::flush_timer();
        match updater.flush(&self.cvr_store) {
            Ok(flushed) => {
                flush_timer.finish();
                state.cvr = flushed;
            },
            Err(_) => {
                flush_timer.set_status("conflict");
                flush_timer.finish();
                handler.cancel();
                return Err(anyhow::Error::new(errors::FlushConflict));
            },
        }

        let added_hashes: BTreeSet<_> = add.iter().map(|(h, ..)| h.clone()).collect();
        self.replay_catchup(state, &mut handler, &old_cvr_version, &added_hashes).await?;
        handler.end(&new_version);
        Ok(())
    }

    /// Batches row updates, paging at `CURSOR_PAGE_SIZE`
    /// and cooperatively yielding every `TIME_SLICE_CHECK_SIZE` rows
    /// once a lap exceeds `TIME_SLICE_MS`.
    async fn process_changes(
        &self,
        updater: &mut CVRQueryDrivenUpdater,
        handler: &mut PokeHandler,
        changes: Vec<RowChange>,
        to_version: &CVRVersion,
    ) {
        let mut batch: BTreeMap<RowId, ReceivedRowChange> = BTreeMap::new();
        let mut lap_start = Instant::now();
        let mut since_check = 0usize;

        for change in changes {
            let row_id = RowId::new(SCHEMA, change.table.clone(), change.row_key.clone());
            let delta = match change.kind {
                RowChangeKind::Add => 1,
                RowChangeKind::Remove => -1,
                RowChangeKind::Edit => 0,
            };
            batch.insert(row_id.clone(), ReceivedRowChange {
                row_id,
                hash: change.query_hash,
                delta,
                contents: change.row,
            });

            if batch.len() >= config::cursor_page_size() {
                self.flush_batch(updater, handler, &mut batch, to_version);
            }
            since_check += 1;
            if since_check >= config::time_slice_check_size() {
                since_check = 0;
                if lap_start.elapsed().as_millis() as u64 >= config::time_slice_ms() {
                    tokio::task::yield_now().await;
                    lap_start = Instant::now();
                }
            }
        }
        self.flush_batch(updater, handler, &mut batch, to_version);
    }

    fn flush_batch(
        &self,
        updater: &mut CVRQueryDrivenUpdater,
        handler: &mut PokeHandler,
        batch: &mut BTreeMap<RowId, ReceivedRowChange>,
        to_version: &CVRVersion,
    ) {
        if batch.is_empty() {
            return;
        }
        let contents: BTreeMap<RowId, Option<serde_json::Value>> = batch
            .iter()
            .map(|(id, change)| (id.clone(), change.contents.clone()))
            .collect();
        let taken = std::mem::take(batch);
        for patch in updater.received(taken) {
            let value = contents.get(&patch.row_id).cloned().flatten();
            let (op, value) = if patch.still_referenced {
                (RowPatchOp::Put, value)
            } else {
                (RowPatchOp::Del, None)
            };
            handler.push_row(&self.client_group_id, &patch.row_id.table, op, value, row_key_json(&patch.row_id), to_version);
        }
    }

    /// Applies a replica advancement's row diff to every hydrated
    /// query and flushes the resulting CVR version.
    async fn advance_pipelines(&self, state: &mut ServiceState, advancement: Advancement) -> anyhow::Result<()> {
        let new_version = CVRVersion::at_state(advancement.version.clone());
        let mut updater = CVRQueryDrivenUpdater::new(state.cvr.clone());
        updater.track_queries(Some(advancement.version), &[], &[]);

        let pokers: Vec<ClientPoker> = self
            .clients
            .lock()
            .iter()
            .filter(|(_, reg)| reg.base_version == state.cvr.version)
            .map(|(id, reg)| reg.poker(id.clone()))
            .collect();
        let mut handler = PokeHandler::start_poke(pokers, new_version.clone(), state.schema_versions);

        self.process_changes(&mut updater, &mut handler, advancement.changes, &new_version).await;
        for row_id in updater.delete_unreferenced_rows() {
            handler.push_row(&self.client_group_id, &row_id.table, RowPatchOp::Del, None, row_key_json(&row_id), &new_version);
        }

        match updater.flush(&self.cvr_store) {
            Ok(flushed) => {
                state.cvr = flushed;
                handler.end(&new_version);
            },
            Err(_) => {
                handler.cancel();
                return Err(anyhow::Error::new(errors::FlushConflict));
            },
        }
        self.evict_inactive_queries(state).await
    }

    /// Replays logged patches so a client reconnecting on an old
    /// cookie catches up without re-hydrating.
    async fn catchup_clients(&self, state: &mut ServiceState) -> anyhow::Result<()> {
        let pokers = self.clients_behind(&state.cvr.version);
        if pokers.is_empty() {
            return Ok(());
        }
        let from = self
            .clients
            .lock()
            .values()
            .map(|reg| reg.base_version.clone())
            .min()
            .unwrap_or_else(CVRVersion::empty);
        let target_version = state.cvr.version.clone();
        let mut handler = PokeHandler::start_poke(pokers, target_version.clone(), state.schema_versions);
        self.replay_catchup(state, &mut handler, &from, &BTreeSet::new()).await?;
        handler.end(&target_version);
        Ok(())
    }

    async fn replay_catchup(
        &self,
        state: &ServiceState,
        handler: &mut PokeHandler,
        from: &CVRVersion,
        exclude_hashes: &BTreeSet<TransformationHash>,
    ) -> anyhow::Result<()> {
        let to_version = state.cvr.version.clone();
        for (_version, row_id, _contents) in self.cvr_store.catchup_row_patches(from).await? {
            if let Some(record) = state.cvr.rows.get(&row_id) {
                if !record.refs.ref_counts.is_empty()
                    && record.refs.ref_counts.keys().all(|h| exclude_hashes.contains(h))
                {
                    continue;
                }
            }
            let live = state.pipeline.get_row(&row_id.table, &row_id.row_key);
            let (op, value) = match live {
                Some(v) => (RowPatchOp::Put, Some(v)),
                None => (RowPatchOp::Del, None),
            };
            handler.push_row(&self.client_group_id, &row_id.table, op, value, row_key_json(&row_id), &to_version);
        }
        for (_version, patch) in self.cvr_store.catchup_config_patches(from).await? {
            handler.push_got(GotQueryPatch { op: into_wire_op(patch.op), hash: patch.hash }, &to_version);
        }
        Ok(())
    }

    /// Evicts least-recently-inactivated non-internal
    /// queries until `rowCount <= maxRowCount`, then reschedules the
    /// eviction timer at the new earliest expiry, capped at
    /// `MAX_EVICTION_TIMER_MS`.
    async fn evict_inactive_queries(&self, state: &mut ServiceState) -> anyhow::Result<()> {
        metrics::set_row_count(self.client_group_id.as_str(), self.cvr_store.row_count() as i64);
        metrics::set_query_set_size(self.client_group_id.as_str(), state.pipeline.added_queries().len() as i64);

        if self.cvr_store.row_count() > self.max_row_count {
            let mut inactive = inactive_queries_by_inactivated_at(&state.cvr);
            inactive.sort_by_key(|(_, inactivated_at)| *inactivated_at);
            for (hash, _) in inactive {
                self.add_and_remove_queries(state, vec![], vec![hash], vec![]).await?;
                metrics::record_eviction("lru", 1);
                if self.cvr_store.row_count() <= self.max_row_count {
                    break;
                }
            }
        }
        self.schedule_eviction_timer(state);
        Ok(())
    }

    fn schedule_eviction_timer(&self, state: &mut ServiceState) {
        let next = state.cvr.desires.values().filter_map(|s| s.eviction_time_ms()).min();
        let Some(next) = next else {
            state.eviction_timer.cancel();
            return;
        };
        let delay_ms = (next - now_ms()).max(0).min(config::max_eviction_timer_ms());
        state
            .eviction_timer
            .schedule(std::time::Duration::from_millis(delay_ms as u64), self.eviction_notify.clone());
    }
}

fn resolve_query_ops(
    cvr: &CvrSnapshot,
    client_id: &ClientId,
    ops: Vec<QuerySetOp>,
) -> (Vec<(TransformationHash, QueryAst, Option<i64>)>, Vec<TransformationHash>) {
    let mut puts = Vec::new();
    let mut dels = Vec::new();
    for op in ops {
        match op {
            QuerySetOp::Put { hash, ast, ttl_ms } => puts.push((hash, ast, ttl_ms)),
            QuerySetOp::Del { hash } => dels.push(hash),
            QuerySetOp::Clear => {
                dels.extend(
                    cvr.desires
                        .keys()
                        .filter(|(c, _)| c == client_id)
                        .map(|(_, h)| h.clone()),
                );
            },
        }
    }
    (puts, dels)
}

/// Eviction candidates keyed by raw `inactivatedAt`, not the ttl-shifted
/// `eviction_time_ms()`: two queries inactivated at the same moment must
/// sort the same regardless of how long their ttls are.
fn inactive_queries_by_inactivated_at(cvr: &CvrSnapshot) -> Vec<(TransformationHash, i64)> {
    cvr.queries
        .iter()
        .filter(|(_, record)| !record.is_internal())
        .filter_map(|(hash, _)| {
            let times: Vec<i64> = cvr
                .desires
                .iter()
                .filter(|((_, h), _)| h == hash)
                .filter(|(_, state)| state.eviction_time_ms().is_some())
                .filter_map(|(_, state)| state.inactivated_at_ms)
                .collect();
            if times.is_empty() {
                None
            } else {
                times.into_iter().max().map(|t| (hash.clone(), t))
            }
        })
        .collect()
}
