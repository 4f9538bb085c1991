//! Wire protocol.

use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    ids::{
        ClientId,
        SchemaVersion,
        TransformationHash,
    },
    query::QueryAst,
    row::RowPatch,
    version::Cookie,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionRange {
    pub min_supported_version: SchemaVersion,
    pub max_supported_version: SchemaVersion,
}

impl SchemaVersionRange {
    pub fn contains(&self, v: SchemaVersion) -> bool {
        v >= self.min_supported_version && v <= self.max_supported_version
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    Put,
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredQueryPatch {
    pub op: PatchOp,
    pub hash: TransformationHash,
    /// Only present on `Put`.
    pub ast: Option<QueryAst>,
    pub ttl_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GotQueryPatch {
    pub op: PatchOp,
    pub hash: TransformationHash,
}

/// Aggregated body of a `pokePart` message. Any field is omitted from
/// the wire form when empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PokePartBody {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub desired_queries_patches: BTreeMap<ClientId, Vec<DesiredQueryPatch>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub got_queries_patch: Vec<GotQueryPatch>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rows_patch: Vec<RowPatch>,
}

impl PokePartBody {
    pub fn is_empty(&self) -> bool {
        self.desired_queries_patches.is_empty()
            && self.got_queries_patch.is_empty()
            && self.last_mutation_id_changes.is_empty()
            && self.rows_patch.is_empty()
    }

    /// Total number of individual patches accumulated, used against
    /// `PART_COUNT_FLUSH_THRESHOLD`.
    pub fn patch_count(&self) -> usize {
        self.desired_queries_patches
            .values()
            .map(|v| v.len())
            .sum::<usize>()
            + self.got_queries_patch.len()
            + self.last_mutation_id_changes.len()
            + self.rows_patch.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokeStart {
    pub poke_id: Cookie,
    pub base_cookie: Option<Cookie>,
    pub schema_versions: Option<SchemaVersionRange>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PokePart {
    pub poke_id: Cookie,
    pub body: PokePartBody,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokeEnd {
    pub poke_id: Cookie,
    pub cookie: Cookie,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteClients {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<ClientId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_group_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    SchemaVersionNotSupported,
    ClientNotFound,
    InvalidConnectionRequestBaseCookie,
    Unauthorized,
    /// A row's numeric field fell outside the `[-(2^53-1), 2^53-1]`
    /// safe-integer range.
    ValueOutOfRange,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Downstream (server → client) messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DownstreamMessage {
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    DeleteClients(DeleteClients),
    Error(ErrorBody),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySetOp {
    Put {
        hash: TransformationHash,
        ast: QueryAst,
        ttl_ms: Option<i64>,
    },
    Del {
        hash: TransformationHash,
    },
    Clear,
}

/// Upstream (client → server) messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamMessage {
    InitConnection {
        desired_queries_patch: Vec<QuerySetOp>,
        client_schema_version: Option<SchemaVersion>,
    },
    ChangeDesiredQueries {
        desired_queries_patch: Vec<QuerySetOp>,
    },
    DeleteClients(DeleteClients),
    CloseConnection,
}

/// Context carried with each upstream call.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub client_id: ClientId,
    pub ws_id: crate::ids::WsId,
    pub base_cookie: Option<Cookie>,
    pub protocol_version: u32,
    pub schema_version: Option<SchemaVersion>,
    pub token_data: Option<crate::auth_contract::TokenData>,
}
