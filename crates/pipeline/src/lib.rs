//! Pipeline Driver: owns the set of live IVM pipelines fed by table
//! sources backed by replica snapshots.

pub mod compiled_query;
pub mod driver;

pub use compiled_query::{
    build as build_query,
    CompiledQuery,
    FieldFilter,
};
pub use driver::{
    Advancement,
    PipelineDriver,
    RowChange,
    RowChangeKind,
};
