//! A compiled query "pipeline". The real AST→pipeline compiler (joins,
//! `exists`, `take`, `filter`, `edit` operators) is treated as an
//! external pure function; `CompiledQuery` is the minimal concrete
//! stand-in that lets `PipelineDriver` exercise real hydrate/advance
//! semantics without reimplementing that compiler. A query's `QueryAst`
//! is decoded into this shape once, at `build()` time.

use anyhow::Context;
use serde_json::Value as Row;
use types::{
    QueryAst,
    TableName,
};

#[derive(Clone, Debug, PartialEq)]
pub enum FieldFilter {
    In(Vec<Row>),
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledQuery {
    pub table: TableName,
    pub filter_field: Option<String>,
    pub filter: FieldFilter,
    /// Rows surfaced by this query exist only to gate visibility for
    /// some other query; the driver hydrates the pipeline but never
    /// yields its rows.
    pub system: Option<String>,
}

impl CompiledQuery {
    pub fn matches(&self, row: &Row) -> bool {
        match (&self.filter_field, &self.filter) {
            (Some(field), FieldFilter::In(values)) => {
                row.get(field).is_some_and(|v| values.contains(v))
            },
            _ => true,
        }
    }

    pub fn is_permission_gate(&self) -> bool {
        self.system.as_deref() == Some("permissions")
    }
}

/// `build()` is the one place the external compiler's output is
/// consumed: decode the opaque `QueryAst` JSON into a `CompiledQuery`.
///
/// Expected shape: `{"table": "issues", "system": "permissions"?,
/// "filter": {"field": "id", "in": [1,2,3]}?}`.
pub fn build(ast: &QueryAst) -> anyhow::Result<CompiledQuery> {
    let obj = ast.0.as_object().context("query ast must be a JSON object")?;
    let table = obj
        .get("table")
        .and_then(|v| v.as_str())
        .context("query ast missing \"table\"")?;
    let system = obj
        .get("system")
        .and_then(|v| v.as_str())
        .map(|s| s.to_owned());
    let (filter_field, filter) = match obj.get("filter") {
        Some(f) => {
            let field = f
                .get("field")
                .and_then(|v| v.as_str())
                .context("filter missing \"field\"")?
                .to_owned();
            let values = f
                .get("in")
                .and_then(|v| v.as_array())
                .context("filter missing \"in\"")?
                .clone();
            (Some(field), FieldFilter::In(values))
        },
        None => (None, FieldFilter::None),
    };
    Ok(CompiledQuery {
        table: TableName::from(table),
        filter_field,
        filter,
        system,
    })
}
