//! Query records.

use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::TransformationHash;

/// Opaque AST handle. The AST→pipeline compiler and permission-rewrite
/// pass are external pure functions; here an AST is just an
/// inert payload the Pipeline Driver's `build` hook knows how to turn
/// into a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAst(pub serde_json::Value);

/// Per-client desired-query state: `{version, ttl, inactivatedAt}`.
///
/// `ttl < 0` means never-expires. `inactivatedAt` is only set once a
/// client has stopped desiring the query; `expired()` is false
/// whenever either is unset, which is also how `internal` queries
/// (which never set `inactivatedAt`) read as non-expiring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQueryState {
    pub version: u64,
    pub ttl_ms: Option<i64>,
    pub inactivated_at_ms: Option<i64>,
}

impl ClientQueryState {
    pub fn active(version: u64) -> Self {
        Self {
            version,
            ttl_ms: None,
            inactivated_at_ms: None,
        }
    }

    /// `inactivatedAt + ttl <= now`. False whenever `ttl < 0` or
    /// `inactivatedAt` is unset, so internal queries and never-expiring
    /// desires read the same way to the eviction path.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        let Some(ttl_ms) = self.ttl_ms else {
            return false;
        };
        if ttl_ms < 0 {
            return false;
        }
        let Some(inactivated_at_ms) = self.inactivated_at_ms else {
            return false;
        };
        inactivated_at_ms + ttl_ms <= now_ms
    }

    pub fn eviction_time_ms(&self) -> Option<i64> {
        let ttl_ms = self.ttl_ms?;
        if ttl_ms < 0 {
            return None;
        }
        let inactivated_at_ms = self.inactivated_at_ms?;
        Some(inactivated_at_ms + ttl_ms)
    }

    pub fn inactivate(&mut self, now_ms: i64) {
        self.inactivated_at_ms.get_or_insert(now_ms);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Server-synthesized (e.g. last-mutation-ID tracking). Never
    /// expires, never evicted.
    Internal,
    /// Per-client desired query.
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub ast: QueryAst,
    pub kind: QueryKind,
    pub transformation_hash: Option<TransformationHash>,
}

impl QueryRecord {
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, QueryKind::Internal)
    }
}
