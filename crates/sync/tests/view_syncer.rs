//! End-to-end scenarios driving `ViewSyncerService` against the
//! in-memory CVR store and a stand-in replica: initial hydration,
//! advancing on a replica commit, a schema-incompatible reset, a
//! schema-version breach, and row-pressure eviction of inactive
//! queries.

use std::{
    sync::{
        Arc,
        Mutex as StdMutex,
    },
    time::Duration,
};

use cvr::InMemoryCvrStore;
use serde_json::json;
use storage::{
    Commit,
    Replica,
    TableSpec,
    TableSpecs,
};
use sync::{
    ClientSink,
    DrainCoordinator,
    ViewSyncerService,
};
use types::{
    message::PatchOp,
    ClientGroupId,
    ClientId,
    DownstreamMessage,
    GotQueryPatch,
    QueryAst,
    QuerySetOp,
    RowPatch,
    RowPatchOp,
    SchemaVersion,
    SchemaVersionRange,
    StateVersion,
    TableName,
    TransformationHash,
    CVRVersion,
};

#[derive(Default)]
struct Recorder {
    messages: StdMutex<Vec<DownstreamMessage>>,
}

impl ClientSink for Recorder {
    fn send(&self, msg: DownstreamMessage) {
        self.messages.lock().unwrap().push(msg);
    }
}

impl Recorder {
    fn drain(&self) -> Vec<DownstreamMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }
}

fn rows_patch(msgs: &[DownstreamMessage]) -> Vec<RowPatch> {
    msgs.iter()
        .filter_map(|m| match m {
            DownstreamMessage::PokePart(p) => Some(p.body.rows_patch.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn got_patch(msgs: &[DownstreamMessage]) -> Vec<GotQueryPatch> {
    msgs.iter()
        .filter_map(|m| match m {
            DownstreamMessage::PokePart(p) => Some(p.body.got_queries_patch.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn lmid_changes(msgs: &[DownstreamMessage]) -> std::collections::BTreeMap<ClientId, u64> {
    let mut out = std::collections::BTreeMap::new();
    for m in msgs {
        if let DownstreamMessage::PokePart(p) = m {
            out.extend(p.body.last_mutation_id_changes.clone());
        }
    }
    out
}

fn has_error(msgs: &[DownstreamMessage]) -> bool {
    msgs.iter().any(|m| matches!(m, DownstreamMessage::Error(_)))
}

fn has_poke_start(msgs: &[DownstreamMessage]) -> bool {
    msgs.iter().any(|m| matches!(m, DownstreamMessage::PokeStart(_)))
}

fn issues_table_specs() -> TableSpecs {
    let mut specs = TableSpecs::new();
    specs.insert(
        TableName::from("issues"),
        TableSpec {
            table: TableName::from("issues"),
            primary_key_columns: vec!["id".into()],
            union_key_columns: vec!["id".into()],
        },
    );
    specs
}

fn seeded_replica() -> Replica {
    let replica = Replica::new(StateVersion::new("00"), issues_table_specs());
    let mut commit = Commit::default();
    for id in 1..=5 {
        commit = commit.put(
            "issues",
            id.to_string(),
            json!({"id": id, "title": format!("issue {id}")}),
        );
    }
    replica.commit(StateVersion::new("01"), commit);
    replica
}

fn query_ast(ids: &[i64]) -> QueryAst {
    QueryAst(json!({
        "table": "issues",
        "filter": {"field": "id", "in": ids},
    }))
}

async fn new_service(replica: Replica, cvr_store: Arc<InMemoryCvrStore>, max_row_count: usize) -> Arc<ViewSyncerService> {
    ViewSyncerService::new(
        ClientGroupId::new("cg1"),
        replica,
        cvr_store,
        max_row_count,
        60_000,
        Arc::new(DrainCoordinator::new()),
    )
    .await
    .unwrap()
}

/// Sends one `version-ready` signal and drives `run` until it drains
/// both that signal and any already-pending eviction notification,
/// which the closed channel's subsequent `None` then breaks out of.
async fn tick(service: &Arc<ViewSyncerService>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tx.send(()).unwrap();
    drop(tx);
    service.run(rx).await;
}

/// Processes exactly one pending eviction notification with no
/// version-ready signal involved. Holding `_tx` open keeps the other
/// `select!` arm permanently pending so the eviction branch is the
/// only one ready; the loop then blocks forever waiting for a second
/// signal, which the timeout cuts off.
async fn eviction_tick(service: &Arc<ViewSyncerService>) {
    let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let _ = tokio::time::timeout(Duration::from_millis(50), service.run(rx)).await;
}

#[tokio::test]
async fn initial_connection_hydrates_matching_rows() {
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(seeded_replica(), cvr_store, 100).await;
    let recorder = Arc::new(Recorder::default());

    service
        .init_connection(
            ClientId::new("c1"),
            CVRVersion::empty(),
            None,
            None,
            vec![QuerySetOp::Put {
                hash: TransformationHash::new("h1"),
                ast: query_ast(&[1, 2, 3]),
                ttl_ms: None,
            }],
            recorder.clone(),
        )
        .await
        .unwrap();

    tick(&service).await;

    let messages = recorder.drain();
    assert!(has_poke_start(&messages));
    let rows = rows_patch(&messages);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.op == RowPatchOp::Put));
}

#[tokio::test]
async fn replica_commit_advances_hydrated_rows() {
    let replica = seeded_replica();
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(replica.clone(), cvr_store, 100).await;
    let recorder = Arc::new(Recorder::default());

    service
        .init_connection(
            ClientId::new("c1"),
            CVRVersion::empty(),
            None,
            None,
            vec![QuerySetOp::Put {
                hash: TransformationHash::new("h1"),
                ast: query_ast(&[1, 2, 3, 4]),
                ttl_ms: None,
            }],
            recorder.clone(),
        )
        .await
        .unwrap();
    tick(&service).await;
    recorder.drain();

    replica.commit(
        StateVersion::new("02"),
        Commit::default()
            .put("issues", "1", json!({"id": 1, "title": "retitled"}))
            .delete("issues", "2"),
    );
    tick(&service).await;

    let rows = rows_patch(&recorder.drain());
    let by_key: std::collections::BTreeMap<&str, &RowPatch> =
        rows.iter().map(|r| (r.id.as_str().unwrap(), r)).collect();
    assert_eq!(by_key["1"].op, RowPatchOp::Put);
    assert_eq!(by_key["2"].op, RowPatchOp::Del);
}

#[tokio::test]
async fn schema_incompatible_change_resets_and_rehydrates() {
    let replica = seeded_replica();
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(replica.clone(), cvr_store, 100).await;
    let recorder = Arc::new(Recorder::default());

    service
        .init_connection(
            ClientId::new("c1"),
            CVRVersion::empty(),
            None,
            None,
            vec![QuerySetOp::Put {
                hash: TransformationHash::new("h1"),
                ast: query_ast(&[1, 2, 3]),
                ttl_ms: None,
            }],
            recorder.clone(),
        )
        .await
        .unwrap();
    tick(&service).await;
    recorder.drain();

    let mut changed = issues_table_specs();
    changed.get_mut(&TableName::from("issues")).unwrap().primary_key_columns = vec!["uuid".into()];
    replica.set_table_specs(changed);
    replica.commit(StateVersion::new("02"), Commit::default());

    // The reset is absorbed silently: no error reaches the client.
    tick(&service).await;
    assert!(!has_error(&recorder.drain()));

    // Pipelines were torn down, so the still-desired query rehydrates
    // fresh on the next tick.
    tick(&service).await;
    let rows = rows_patch(&recorder.drain());
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.op == RowPatchOp::Put));
}

#[tokio::test]
async fn schema_version_outside_supported_range_fails_that_client_only() {
    let replica = seeded_replica();
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(replica, cvr_store, 100).await;

    let in_range = Arc::new(Recorder::default());
    let out_of_range = Arc::new(Recorder::default());

    service
        .init_connection(
            ClientId::new("good"),
            CVRVersion::empty(),
            Some(SchemaVersion(3)),
            None,
            vec![],
            in_range.clone(),
        )
        .await
        .unwrap();
    service
        .init_connection(
            ClientId::new("stale"),
            CVRVersion::empty(),
            Some(SchemaVersion(1)),
            None,
            vec![],
            out_of_range.clone(),
        )
        .await
        .unwrap();
    service
        .set_schema_versions(Some(SchemaVersionRange {
            min_supported_version: SchemaVersion(2),
            max_supported_version: SchemaVersion(3),
        }))
        .await;

    service
        .change_desired_queries(
            ClientId::new("good"),
            vec![QuerySetOp::Put {
                hash: TransformationHash::new("h1"),
                ast: query_ast(&[1]),
                ttl_ms: None,
            }],
        )
        .await
        .unwrap();

    let good_messages = in_range.drain();
    let stale_messages = out_of_range.drain();
    assert!(!has_error(&good_messages));
    assert!(has_poke_start(&good_messages));
    assert!(has_error(&stale_messages));
}

#[tokio::test]
async fn row_pressure_evicts_by_inactivation_order_not_ttl() {
    let replica = seeded_replica();
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    // Both queries fit (5 rows total), but the cap forces eviction
    // down to whichever single query's rows remain.
    let service = new_service(replica, cvr_store, 3).await;
    let recorder = Arc::new(Recorder::default());

    // Ttls are deliberately inverted relative to inactivation order:
    // `early` has the long ttl but is inactivated first, `late` has
    // the short ttl but is inactivated second. Sorting by the
    // ttl-shifted eviction time would evict `late` first; sorting by
    // raw inactivation time, as least-recently-inactivated-first
    // requires, evicts `early` first.
    let early = TransformationHash::new("early");
    let late = TransformationHash::new("late");

    service
        .init_connection(
            ClientId::new("c1"),
            CVRVersion::empty(),
            None,
            None,
            vec![
                QuerySetOp::Put {
                    hash: early.clone(),
                    ast: query_ast(&[1, 2, 3]),
                    ttl_ms: Some(100_000),
                },
                QuerySetOp::Put {
                    hash: late.clone(),
                    ast: query_ast(&[4, 5]),
                    ttl_ms: Some(10),
                },
            ],
            recorder.clone(),
        )
        .await
        .unwrap();

    service
        .change_desired_queries(ClientId::new("c1"), vec![QuerySetOp::Del { hash: early.clone() }])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    service
        .change_desired_queries(ClientId::new("c1"), vec![QuerySetOp::Del { hash: late.clone() }])
        .await
        .unwrap();

    tick(&service).await;

    let messages = recorder.drain();
    let got = got_patch(&messages);
    assert!(got.iter().any(|p| p.hash == early && p.op == PatchOp::Del));
    assert!(!got.iter().any(|p| p.hash == late && p.op == PatchOp::Del));

    let rows = rows_patch(&messages);
    let deleted_keys: std::collections::BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.op == RowPatchOp::Del)
        .map(|r| r.id.as_str().unwrap())
        .collect();
    assert!(deleted_keys.contains("1"));
    assert!(deleted_keys.contains("2"));
    assert!(deleted_keys.contains("3"));
    assert!(!deleted_keys.contains("4"));
    assert!(!deleted_keys.contains("5"));
}

#[tokio::test]
async fn eviction_notification_alone_triggers_a_pressure_pass() {
    let replica = seeded_replica();
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(replica, cvr_store, 100).await;
    let recorder = Arc::new(Recorder::default());

    service
        .init_connection(
            ClientId::new("c1"),
            CVRVersion::empty(),
            None,
            None,
            vec![QuerySetOp::Put {
                hash: TransformationHash::new("h1"),
                ast: query_ast(&[1, 2, 3, 4, 5]),
                ttl_ms: None,
            }],
            recorder.clone(),
        )
        .await
        .unwrap();
    tick(&service).await;
    recorder.drain();

    // Dropping a query nobody ever desired is a config-only no-op that
    // still wakes the eviction notifier; with rows well under the
    // (generous) cap, the resulting pressure pass finds nothing to do.
    service
        .change_desired_queries(
            ClientId::new("c1"),
            vec![QuerySetOp::Del {
                hash: TransformationHash::new("never-desired"),
            }],
        )
        .await
        .unwrap();
    recorder.drain();
    eviction_tick(&service).await;
    assert!(recorder.drain().is_empty());
}

#[tokio::test]
async fn internal_lmid_query_surfaces_last_mutation_id_changes() {
    let replica = Replica::new(StateVersion::new("00"), issues_table_specs());
    replica.commit(
        StateVersion::new("01"),
        Commit::default().put(
            "cg1_0.clients",
            "c1",
            json!({"clientID": "c1", "clientGroupID": "cg1", "lastMutationID": 7}),
        ),
    );
    let cvr_store = Arc::new(InMemoryCvrStore::empty(ClientGroupId::new("cg1"), "owner-a".to_string()));
    let service = new_service(replica, cvr_store, 100).await;
    let recorder = Arc::new(Recorder::default());

    // The connecting client desires nothing of its own; the internal
    // lmid query is seeded by the service itself on first sync.
    service
        .init_connection(ClientId::new("c1"), CVRVersion::empty(), None, None, vec![], recorder.clone())
        .await
        .unwrap();

    tick(&service).await;

    let messages = recorder.drain();
    assert!(has_poke_start(&messages));
    assert_eq!(lmid_changes(&messages).get(&ClientId::new("c1")), Some(&7));
    // The lmid row itself is merged into `lastMutationIDChanges`, never
    // a `rowsPatch` entry.
    assert!(rows_patch(&messages).is_empty());
}
