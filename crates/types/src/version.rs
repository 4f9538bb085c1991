//! `CVRVersion`/`Cookie` — the lexicographically-sortable watermark pair
//! used to order every row and config patch the View Syncer ever sends.

use std::{
    cmp::Ordering,
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};

/// A replication watermark. Produced by the upstream replicator at each
/// commit; compared lexicographically as a string, never parsed as a
/// number (it may not be numeric in every deployment).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct StateVersion(pub String);

impl StateVersion {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl PartialOrd for StateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StateVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(stateVersion, minorVersion)`. Minor versions are server-synthesized
/// sub-increments for CVR-only changes that happen between upstream
/// commits (adding/removing queries, deleting clients).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CVRVersion {
    pub state_version: StateVersion,
    pub minor_version: u32,
}

impl CVRVersion {
    pub fn empty() -> Self {
        Self {
            state_version: StateVersion::new("00"),
            minor_version: 0,
        }
    }

    pub fn new(state_version: StateVersion, minor_version: u32) -> Self {
        Self {
            state_version,
            minor_version,
        }
    }

    /// Bump the minor version in place, keeping the same `stateVersion`.
    /// Used by CVR-only mutations (query add/remove, client delete) that
    /// happen between replication commits.
    pub fn next_minor(&self) -> Self {
        Self {
            state_version: self.state_version.clone(),
            minor_version: self.minor_version + 1,
        }
    }

    /// Start a new major version at a freshly-observed replication
    /// watermark, resetting the minor counter.
    pub fn at_state(state_version: StateVersion) -> Self {
        Self {
            state_version,
            minor_version: 0,
        }
    }
}

impl Default for CVRVersion {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialOrd for CVRVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CVRVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.state_version
            .cmp(&other.state_version)
            .then(self.minor_version.cmp(&other.minor_version))
    }
}

/// The wire form of a `CVRVersion`. `"123:02"` when `minor > 0`,
/// otherwise bare `"123"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie(pub String);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn version_to_cookie(v: &CVRVersion) -> Cookie {
    if v.minor_version > 0 {
        Cookie(format!("{}:{:02}", v.state_version, v.minor_version))
    } else {
        Cookie(v.state_version.0.clone())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed cookie: {0}")]
pub struct CookieParseError(String);

pub fn cookie_to_version(cookie: &Cookie) -> Result<CVRVersion, CookieParseError> {
    match cookie.0.split_once(':') {
        Some((state, minor)) => {
            let minor_version = minor
                .parse::<u32>()
                .map_err(|_| CookieParseError(cookie.0.clone()))?;
            Ok(CVRVersion::new(StateVersion::new(state), minor_version))
        },
        None => Ok(CVRVersion::at_state(StateVersion::new(cookie.0.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_cookie_is_bare_state_version() {
        assert_eq!(version_to_cookie(&CVRVersion::empty()).0, "00");
    }

    #[test]
    fn minor_version_uses_colon_separator() {
        let v = CVRVersion::new(StateVersion::new("123"), 2);
        assert_eq!(version_to_cookie(&v).0, "123:02");
    }

    #[test]
    fn ordering_is_lexicographic_then_numeric() {
        let a = CVRVersion::new(StateVersion::new("01"), 5);
        let b = CVRVersion::new(StateVersion::new("02"), 0);
        assert!(a < b);

        let c = CVRVersion::new(StateVersion::new("05"), 1);
        let d = CVRVersion::new(StateVersion::new("05"), 2);
        assert!(c < d);
    }

    proptest! {
        #[test]
        fn cookie_roundtrips(state in "[0-9a-f]{1,8}", minor in 0u32..1000) {
            let v = CVRVersion::new(StateVersion::new(state), minor);
            let cookie = version_to_cookie(&v);
            let parsed = cookie_to_version(&cookie).unwrap();
            prop_assert_eq!(parsed, v);
        }
    }
}
