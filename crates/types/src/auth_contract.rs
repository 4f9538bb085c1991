//! The only contract the View Syncer has with auth token parsing: a
//! decoded token carries a subject and, optionally, an issued-at
//! timestamp. Parsing/verifying the raw token is out of scope.

use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub sub: String,
    pub iat: Option<i64>,
}
