//! Client Handler & Poke protocol: framing `pokeStart` /
//! `pokePart` / `pokeEnd` for one or many clients at once, with
//! per-client skip rules and patch-count-triggered flushing.

use std::sync::Arc;

use errors::ErrorMetadata;
use types::{
    version_to_cookie,
    ClientGroupId,
    ClientId,
    Cookie,
    DesiredQueryPatch as WireDesiredQueryPatch,
    DownstreamMessage,
    ErrorBody,
    GotQueryPatch as WireGotQueryPatch,
    PokeEnd,
    PokePart,
    PokePartBody,
    PokeStart,
    RowPatch,
    RowPatchOp,
    SchemaVersion,
    SchemaVersionRange,
    TableName,
    CVRVersion,
};

use crate::config;

/// Where a poker's messages land. The websocket transport is out of
/// scope; this is the seam a real dispatcher plugs into.
pub trait ClientSink: Send + Sync {
    fn send(&self, msg: DownstreamMessage);
}

impl ClientSink for tokio::sync::mpsc::UnboundedSender<DownstreamMessage> {
    fn send(&self, msg: DownstreamMessage) {
        let _ = tokio::sync::mpsc::UnboundedSender::send(self, msg);
    }
}

/// Checks every numeric leaf of `value` is within `[-(2^53-1), 2^53-1]`.
pub fn check_safe_integers(value: &serde_json::Value) -> Result<(), ErrorMetadata> {
    const MAX_SAFE_INTEGER: i64 = (1i64 << 53) - 1;
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                    return Err(ErrorMetadata::value_out_of_range(format!(
                        "numeric value {i} exceeds the safe integer range"
                    )));
                }
            } else if let Some(f) = n.as_f64() {
                if f.abs() > MAX_SAFE_INTEGER as f64 {
                    return Err(ErrorMetadata::value_out_of_range(format!(
                        "numeric value {f} exceeds the safe integer range"
                    )));
                }
            }
            Ok(())
        },
        serde_json::Value::Array(items) => {
            items.iter().try_for_each(check_safe_integers)
        },
        serde_json::Value::Object(fields) => {
            fields.values().try_for_each(check_safe_integers)
        },
        _ => Ok(()),
    }
}

/// Per-shard last-mutation-ID row: `"{appID}_{shardNum}.clients"`.
/// Rows from this table never become a `rowsPatch` entry.
fn is_lmid_table(table: &TableName) -> bool {
    table.as_str().ends_with(".clients")
}

struct LmidRow {
    client_id: ClientId,
    client_group_id: String,
    last_mutation_id: u64,
}

fn parse_lmid_row(value: &serde_json::Value) -> Option<LmidRow> {
    let obj = value.as_object()?;
    Some(LmidRow {
        client_id: ClientId::new(obj.get("clientID")?.as_str()?),
        client_group_id: obj.get("clientGroupID")?.as_str()?.to_string(),
        last_mutation_id: obj.get("lastMutationID")?.as_u64()?,
    })
}

/// Per-client poke framer. One lives per connected `(clientID, wsID)`
/// for the duration of a single poke transaction.
pub struct ClientPoker {
    client_id: ClientId,
    base_version: CVRVersion,
    schema_version: Option<SchemaVersion>,
    sink: Arc<dyn ClientSink>,
    poke_id: Cookie,
    active: bool,
    start_sent: bool,
    sent_any_part: bool,
    part: PokePartBody,
}

impl ClientPoker {
    pub fn new(
        client_id: ClientId,
        base_version: CVRVersion,
        schema_version: Option<SchemaVersion>,
        sink: Arc<dyn ClientSink>,
    ) -> Self {
        Self {
            client_id,
            base_version,
            schema_version,
            sink,
            poke_id: Cookie(String::new()),
            active: false,
            start_sent: false,
            sent_any_part: false,
            part: PokePartBody::default(),
        }
    }

    fn start(&mut self, tentative_version: &CVRVersion, schema_versions: Option<SchemaVersionRange>) {
        if &self.base_version >= tentative_version {
            self.active = false;
            return;
        }
        if let Some(range) = schema_versions {
            let in_range = self.schema_version.map(|v| range.contains(v)).unwrap_or(false);
            if !in_range {
                self.fail(ErrorMetadata::schema_version_not_supported(
                    self.schema_version.map(|v| v.0),
                    range.min_supported_version.0,
                    range.max_supported_version.0,
                ));
                self.active = false;
                return;
            }
        }
        self.active = true;
        self.poke_id = version_to_cookie(tentative_version);
        self.sink.send(DownstreamMessage::PokeStart(PokeStart {
            poke_id: self.poke_id.clone(),
            base_cookie: Some(version_to_cookie(&self.base_version)),
            schema_versions,
        }));
        self.start_sent = true;
    }

    fn maybe_flush(&mut self) {
        if self.part.patch_count() >= config::part_count_flush_threshold() {
            self.flush_part();
        }
    }

    fn flush_part(&mut self) {
        if self.part.is_empty() {
            return;
        }
        let body = std::mem::take(&mut self.part);
        self.sink.send(DownstreamMessage::PokePart(PokePart {
            poke_id: self.poke_id.clone(),
            body,
        }));
        self.sent_any_part = true;
    }

    pub fn push_desired(&mut self, patch: WireDesiredQueryPatch, to_version: &CVRVersion) {
        if !self.active || to_version <= &self.base_version {
            return;
        }
        self.part
            .desired_queries_patches
            .entry(self.client_id.clone())
            .or_default()
            .push(patch);
        self.maybe_flush();
    }

    pub fn push_got(&mut self, patch: WireGotQueryPatch, to_version: &CVRVersion) {
        if !self.active || to_version <= &self.base_version {
            return;
        }
        self.part.got_queries_patch.push(patch);
        self.maybe_flush();
    }

    /// Route a row patch: LMID rows are merged into
    /// `lastMutationIDChanges`, everything else becomes a `rowsPatch`
    /// entry, after the bigint safety check.
    pub fn push_row(
        &mut self,
        client_group_id: &ClientGroupId,
        table_name: TableName,
        op: RowPatchOp,
        value: Option<serde_json::Value>,
        id: serde_json::Value,
        to_version: &CVRVersion,
    ) {
        if !self.active || to_version <= &self.base_version {
            return;
        }
        if is_lmid_table(&table_name) {
            if let Some(contents) = &value {
                match parse_lmid_row(contents) {
                    Some(row) if row.client_group_id == client_group_id.as_str() => {
                        self.part
                            .last_mutation_id_changes
                            .insert(row.client_id, row.last_mutation_id);
                        self.maybe_flush();
                    },
                    Some(row) => {
                        tracing::warn!(
                            expected = %client_group_id,
                            found = %row.client_group_id,
                            "dropping lmid row for mismatched client group"
                        );
                    },
                    None => {
                        tracing::warn!("dropping malformed lmid row");
                    },
                }
            }
            return;
        }
        if let Some(contents) = &value {
            if let Err(err) = check_safe_integers(contents) {
                self.fail(err);
                return;
            }
        }
        self.part.rows_patch.push(RowPatch {
            op,
            table_name,
            value,
            id,
        });
        self.maybe_flush();
    }

    pub fn fail(&mut self, err: ErrorMetadata) {
        self.sink.send(DownstreamMessage::Error(ErrorBody {
            kind: err.kind,
            message: err.msg.into_owned(),
        }));
        self.active = false;
        crate::metrics::record_poke("error");
    }

    fn end(&mut self, final_version: &CVRVersion) {
        if !self.active {
            return;
        }
        self.flush_part();
        if !self.sent_any_part && &self.base_version == final_version {
            return;
        }
        debug_assert!(
            !self.sent_any_part || final_version > &self.base_version,
            "finalVersion must advance past baseVersion once parts were sent"
        );
        self.sink.send(DownstreamMessage::PokeEnd(PokeEnd {
            poke_id: self.poke_id.clone(),
            cookie: version_to_cookie(final_version),
            cancel: false,
        }));
        crate::metrics::record_poke("success");
    }

    fn cancel(&mut self) {
        if !self.start_sent {
            return;
        }
        self.sink.send(DownstreamMessage::PokeEnd(PokeEnd {
            poke_id: self.poke_id.clone(),
            cookie: Cookie(String::new()),
            cancel: true,
        }));
        crate::metrics::record_poke("cancelled");
    }
}

/// Composite poker broadcasting to every connected client under
/// all-settled semantics: a failed client never blocks delivery to
/// the others.
pub struct PokeHandler {
    pokers: Vec<ClientPoker>,
    tentative_version: CVRVersion,
}

impl PokeHandler {
    pub fn start_poke(
        mut clients: Vec<ClientPoker>,
        tentative_version: CVRVersion,
        schema_versions: Option<SchemaVersionRange>,
    ) -> Self {
        for poker in clients.iter_mut() {
            poker.start(&tentative_version, schema_versions);
        }
        Self {
            pokers: clients,
            tentative_version,
        }
    }

    pub fn tentative_version(&self) -> &CVRVersion {
        &self.tentative_version
    }

    pub fn push_desired(&mut self, client_id: &ClientId, patch: WireDesiredQueryPatch, to_version: &CVRVersion) {
        for poker in self.pokers.iter_mut().filter(|p| &p.client_id == client_id) {
            poker.push_desired(patch.clone(), to_version);
        }
    }

    pub fn push_got(&mut self, patch: WireGotQueryPatch, to_version: &CVRVersion) {
        for poker in self.pokers.iter_mut() {
            poker.push_got(patch.clone(), to_version);
        }
    }

    pub fn push_row(
        &mut self,
        client_group_id: &ClientGroupId,
        table_name: &TableName,
        op: RowPatchOp,
        value: Option<serde_json::Value>,
        id: serde_json::Value,
        to_version: &CVRVersion,
    ) {
        for poker in self.pokers.iter_mut() {
            poker.push_row(
                client_group_id,
                table_name.clone(),
                op.clone(),
                value.clone(),
                id.clone(),
                to_version,
            );
        }
    }

    pub fn end(mut self, final_version: &CVRVersion) {
        for poker in self.pokers.iter_mut() {
            poker.end(final_version);
        }
    }

    pub fn cancel(mut self) {
        for poker in self.pokers.iter_mut() {
            poker.cancel();
        }
    }
}
