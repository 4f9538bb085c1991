//! Shared data model and wire protocol for the View Syncer.

pub mod auth_contract;
pub mod ids;
pub mod message;
pub mod query;
pub mod row;
pub mod version;

pub use ids::{
    ClientGroupId,
    ClientId,
    RowKey,
    SchemaName,
    SchemaVersion,
    TableName,
    TransformationHash,
    WsId,
};
pub use message::{
    ConnectionContext,
    DeleteClients,
    DesiredQueryPatch,
    DownstreamMessage,
    ErrorBody,
    ErrorKind,
    GotQueryPatch,
    PokeEnd,
    PokePart,
    PokePartBody,
    PokeStart,
    QuerySetOp,
    SchemaVersionRange,
    UpstreamMessage,
};
pub use query::{
    ClientQueryState,
    QueryAst,
    QueryKind,
    QueryRecord,
};
pub use row::{
    RowId,
    RowPatch,
    RowPatchOp,
    RowRefs,
};
pub use version::{
    cookie_to_version,
    version_to_cookie,
    CVRVersion,
    Cookie,
    StateVersion,
};
