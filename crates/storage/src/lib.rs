//! Replica snapshotting and per-table data sources.

pub mod replica;
pub mod snapshot;
pub mod snapshotter;
pub mod table_source;

pub use replica::{
    Commit,
    Replica,
    RowWrite,
};
pub use snapshot::{
    Snapshot,
    TableSpec,
    TableSpecs,
};
pub use snapshotter::{
    DiffRecord,
    SnapshotDiff,
    Snapshotter,
};
pub use table_source::{
    ChangeSink,
    RowChangeKind,
    SourceChange,
    TableSource,
};
