//! Pipeline Driver.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    time::Instant,
};

use errors::ResetPipelinesSignal;
use storage::{
    ChangeSink,
    Replica,
    Snapshot,
    Snapshotter,
    SourceChange,
    TableSource,
    TableSpec,
    TableSpecs,
};
use types::{
    QueryAst,
    RowKey,
    StateVersion,
    TableName,
    TransformationHash,
};

use crate::compiled_query::{
    self,
    CompiledQuery,
};

#[derive(Clone, Debug, PartialEq)]
pub enum RowChangeKind {
    Add,
    Remove,
    Edit,
}

/// `{type, queryHash, table, rowKey, row|undefined}`. `row` is `None` for `Remove`; the old row is
/// implied by `row_key`, never carried.
#[derive(Clone, Debug, PartialEq)]
pub struct RowChange {
    pub kind: RowChangeKind,
    pub query_hash: TransformationHash,
    pub table: TableName,
    pub row_key: RowKey,
    pub row: Option<serde_json::Value>,
}

struct LivePipeline {
    query: CompiledQuery,
    /// The table's key shape as of hydration. Pinned here rather than
    /// re-read live, so a schema change on the replica after
    /// hydration shows up as a mismatch in `current_table_specs`.
    table_spec: Option<TableSpec>,
    hydration_ms: f64,
}

pub struct Advancement {
    pub version: StateVersion,
    pub changes: Vec<RowChange>,
}

/// Receives a Table Source's pushed diffs for one table and classifies
/// each against every live pipeline on that table by prev/next match
/// transition.
struct PipelineChangeSink<'a> {
    pipelines: &'a BTreeMap<TransformationHash, LivePipeline>,
    table: TableName,
    changes: Vec<RowChange>,
}

impl ChangeSink for PipelineChangeSink<'_> {
    fn push(&mut self, change: SourceChange) {
        for (hash, pipeline) in self.pipelines {
            if pipeline.query.table != self.table || pipeline.query.is_permission_gate() {
                continue;
            }
            let prev_matches = change.old_row.as_ref().is_some_and(|v| pipeline.query.matches(v));
            let next_matches = change.row.as_ref().is_some_and(|v| pipeline.query.matches(v));
            let kind = match (prev_matches, next_matches) {
                (false, true) => RowChangeKind::Add,
                (true, false) => RowChangeKind::Remove,
                (true, true) => RowChangeKind::Edit,
                (false, false) => continue,
            };
            self.changes.push(RowChange {
                kind,
                query_hash: hash.clone(),
                table: self.table.clone(),
                row_key: change.row_key.clone(),
                row: change.row.clone(),
            });
        }
    }
}

/// Owns the set of live query pipelines, keyed by `transformationHash`
///. `init` must be called exactly once before any other
/// operation.
pub struct PipelineDriver {
    replica: Replica,
    snapshotter: Option<Snapshotter>,
    replica_version: Option<StateVersion>,
    pipelines: BTreeMap<TransformationHash, LivePipeline>,
    /// One Table Source per table with at least one live pipeline,
    /// rebound to the latest snapshot after every `advance`.
    table_sources: BTreeMap<TableName, TableSource>,
    total_hydration_ms: f64,
}

impl PipelineDriver {
    pub fn new(replica: Replica) -> Self {
        Self {
            replica,
            snapshotter: None,
            replica_version: None,
            pipelines: BTreeMap::new(),
            table_sources: BTreeMap::new(),
            total_hydration_ms: 0.0,
        }
    }

    /// Initialize from the current snapshot, reading the replica's
    /// version. Must be called exactly once before any other op.
    pub fn init(&mut self) {
        assert!(self.snapshotter.is_none(), "PipelineDriver::init called twice");
        let (snapshotter, version) = Snapshotter::init(self.replica.clone());
        self.snapshotter = Some(snapshotter);
        self.replica_version = Some(version);
    }

    fn snapshotter(&self) -> &Snapshotter {
        self.snapshotter.as_ref().expect("PipelineDriver::init was not called")
    }

    fn snapshotter_mut(&mut self) -> &mut Snapshotter {
        self.snapshotter.as_mut().expect("PipelineDriver::init was not called")
    }

    /// The replica's schema/data version as of first sync. Immutable
    /// until `reset`.
    pub fn replica_version(&self) -> &StateVersion {
        self.replica_version.as_ref().expect("PipelineDriver::init was not called")
    }

    pub fn current_version(&self) -> &StateVersion {
        &self.snapshotter().current().state_version
    }

    fn current_table_specs(&self) -> TableSpecs {
        let mut specs = TableSpecs::new();
        for pipeline in self.pipelines.values() {
            if let Some(spec) = &pipeline.table_spec {
                specs.insert(pipeline.query.table.clone(), spec.clone());
            }
        }
        specs
    }

    /// Idempotent: a hash already present yields no `RowChange`s.
    /// Otherwise builds the pipeline, hydrates it by fetching every
    /// row of its table from the current snapshot, and yields one
    /// `RowChange` per surfaced row. Rows from a
    /// `system == "permissions"` query are never yielded; they exist
    /// only to gate visibility.
    pub fn add_query(
        &mut self,
        hash: TransformationHash,
        ast: &QueryAst,
    ) -> anyhow::Result<Vec<RowChange>> {
        if self.pipelines.contains_key(&hash) {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let query = compiled_query::build(ast)?;
        let table_spec = self.replica.table_specs().get(&query.table).cloned();
        let mut changes = Vec::new();
        if !query.is_permission_gate() {
            let snapshot = self.snapshotter().current().clone();
            let source = self
                .table_sources
                .entry(query.table.clone())
                .or_insert_with(|| TableSource::new(query.table.clone(), snapshot));
            for (row_key, row) in source.fetch() {
                if query.matches(&row) {
                    changes.push(RowChange {
                        kind: RowChangeKind::Add,
                        query_hash: hash.clone(),
                        table: query.table.clone(),
                        row_key,
                        row: Some(row),
                    });
                }
            }
        }
        let hydration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.total_hydration_ms += hydration_ms;
        tracing::debug!(hash = %hash, rows = changes.len(), hydration_ms, "hydrated query");
        self.pipelines.insert(hash, LivePipeline { query, table_spec, hydration_ms });
        Ok(changes)
    }

    pub fn remove_query(&mut self, hash: &TransformationHash) {
        self.pipelines.remove(hash);
    }

    pub fn added_queries(&self) -> BTreeSet<TransformationHash> {
        self.pipelines.keys().cloned().collect()
    }

    /// Advance every live pipeline to the latest replica snapshot,
    /// pushing the Snapshotter's row diff through each table's pipeline
    /// and yielding the resulting `RowChange`s. Lazy in spirit: the
    /// Snapshotter only actually advances once this is called, and the
    /// caller is expected to consume `changes` fully.
    pub fn advance(&mut self) -> Result<Advancement, ResetPipelinesSignal> {
        let table_specs = self.current_table_specs();
        let diff = self.snapshotter_mut().advance(&table_specs)?;
        let snapshot = self.snapshotter().current().clone();
        let mut changes = Vec::new();
        for record in diff.records {
            let source = self
                .table_sources
                .entry(record.table.clone())
                .or_insert_with(|| TableSource::new(record.table.clone(), snapshot.clone()));
            let mut sink = PipelineChangeSink {
                pipelines: &self.pipelines,
                table: record.table.clone(),
                changes: Vec::new(),
            };
            source.push_diff(&mut sink, record.row_key, record.prev_value, record.next_value);
            changes.extend(sink.changes);
        }
        // After iteration completes, every Table Source is rebound to
        // the new snapshot.
        for source in self.table_sources.values_mut() {
            source.set_db(snapshot.clone());
        }
        Ok(Advancement {
            version: self.snapshotter().current().state_version.clone(),
            changes,
        })
    }

    /// Fast-forward without computing a diff, used when no pipelines
    /// have been hydrated yet.
    pub fn advance_without_diff(&mut self) {
        self.snapshotter_mut().advance_without_diff();
    }

    /// Destroy all pipelines and recompute table specs. Re-reads
    /// `replica_version`.
    pub fn reset(&mut self) {
        self.pipelines.clear();
        self.table_sources.clear();
        let (snapshotter, version) = Snapshotter::init(self.replica.clone());
        self.snapshotter = Some(snapshotter);
        self.replica_version = Some(version);
    }

    pub fn get_row(&self, table: &TableName, key: &RowKey) -> Option<serde_json::Value> {
        self.snapshotter().current().get_row(table, key)
    }

    pub fn total_hydration_time_ms(&self) -> f64 {
        self.total_hydration_ms
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.snapshotter().current()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storage::Commit;

    use super::*;
    use crate::driver::test_support::{
        issues_query_ast,
        issues_replica,
    };

    #[test]
    fn add_query_is_idempotent() {
        let replica = issues_replica();
        let mut driver = PipelineDriver::new(replica);
        driver.init();
        let hash = TransformationHash::from("h1");
        let ast = issues_query_ast(&[1, 2, 3, 4]);
        let first = driver.add_query(hash.clone(), &ast).unwrap();
        assert_eq!(first.len(), 4);
        let second = driver.add_query(hash, &ast).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn permission_queries_hydrate_without_yielding_rows() {
        let replica = issues_replica();
        let mut driver = PipelineDriver::new(replica);
        driver.init();
        let ast = QueryAst(json!({"table": "issues", "system": "permissions"}));
        let changes = driver.add_query(TransformationHash::from("perm"), &ast).unwrap();
        assert!(changes.is_empty());
        assert_eq!(driver.added_queries().len(), 1);
    }

    #[test]
    fn advance_yields_edit_and_remove() {
        let replica = issues_replica();
        let mut driver = PipelineDriver::new(replica.clone());
        driver.init();
        let hash = TransformationHash::from("h1");
        driver.add_query(hash.clone(), &issues_query_ast(&[1, 2, 3, 4])).unwrap();

        replica.commit(
            StateVersion::new("123"),
            Commit::default()
                .put("issues", "1", json!({"id": 1, "title": "new title"}))
                .delete("issues", "2"),
        );
        let advancement = driver.advance().unwrap();
        assert_eq!(advancement.version, StateVersion::new("123"));
        let kinds: Vec<_> = advancement
            .changes
            .iter()
            .map(|c| (c.row_key.as_str().to_owned(), c.kind.clone()))
            .collect();
        assert!(kinds.contains(&("1".to_string(), RowChangeKind::Edit)));
        assert!(kinds.contains(&("2".to_string(), RowChangeKind::Remove)));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::json;
    use storage::{
        Commit,
        Replica,
        TableSpec,
        TableSpecs,
    };
    use types::{
        QueryAst,
        StateVersion,
        TableName,
    };

    pub fn issues_replica() -> Replica {
        let mut specs = TableSpecs::new();
        specs.insert(
            TableName::from("issues"),
            TableSpec {
                table: TableName::from("issues"),
                primary_key_columns: vec!["id".into()],
                union_key_columns: vec!["id".into()],
            },
        );
        let replica = Replica::new(StateVersion::new("00"), specs);
        let mut commit = Commit::default();
        for id in 1..=5 {
            commit = commit.put("issues", id.to_string(), json!({"id": id, "title": format!("issue {id}")}));
        }
        replica.commit(StateVersion::new("01"), commit);
        replica
    }

    pub fn issues_query_ast(ids: &[i64]) -> QueryAst {
        QueryAst(json!({
            "table": "issues",
            "filter": {"field": "id", "in": ids},
        }))
    }
}
