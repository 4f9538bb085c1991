//! Identifiers used throughout the View Syncer. Thin newtypes over
//! `String`/`u64` rather than bare primitives, so raw strings never
//! cross component boundaries unlabeled.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ClientGroupId);
string_id!(ClientId);
string_id!(WsId);
/// Hash of a query's AST after the (external) permission-rewrite pass.
/// Pipelines are keyed by this; queries with equal hashes share one
/// pipeline.
string_id!(TransformationHash);
string_id!(SchemaName);
string_id!(TableName);
string_id!(RowKey);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);
