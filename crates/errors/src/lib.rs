//! Error taxonomy for the View Syncer.
//!
//! `ErrorMetadata` can be attached to an `anyhow::Error` chain via
//! `.context(..)`; it tags an error with a machine-checkable `code` and
//! `short_msg` as well as a developer-facing `msg`. The closed set of
//! client-visible kinds here is narrow by design, plus the two
//! internal signals (`ResetPipelines`, ownership conflict) the View
//! Syncer must distinguish from generic failures.

use std::borrow::Cow;

use types::message::ErrorKind;

/// A per-client or per-group error tagged with enough structure to
/// decide how it should propagate.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub kind: ErrorKind,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

impl ErrorMetadata {
    pub fn schema_version_not_supported(
        schema_version: Option<u32>,
        min: u32,
        max: u32,
    ) -> Self {
        let observed = schema_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        Self {
            kind: ErrorKind::SchemaVersionNotSupported,
            short_msg: "SchemaVersionNotSupported".into(),
            msg: format!(
                "Schema version {observed} is not in range of supported schema versions [{min}, \
                 {max}]."
            )
            .into(),
        }
    }

    pub fn client_not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::ClientNotFound,
            short_msg: "ClientNotFound".into(),
            msg: msg.into(),
        }
    }

    pub fn invalid_base_cookie(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::InvalidConnectionRequestBaseCookie,
            short_msg: "InvalidConnectionRequestBaseCookie".into(),
            msg: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::Unauthorized,
            short_msg: "Unauthorized".into(),
            msg: msg.into(),
        }
    }

    pub fn value_out_of_range(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::ValueOutOfRange,
            short_msg: "ValueOutOfRange".into(),
            msg: msg.into(),
        }
    }
}

/// A schema-incompatible replica change was observed while diffing two
/// snapshots. Non-fatal: the owner discards pipelines and re-hydrates.
#[derive(thiserror::Error, Debug, Clone)]
#[error("pipelines must reset: {0}")]
pub struct ResetPipelinesSignal(pub String);

/// Another View Syncer instance has taken over ownership of this
/// client group's CVR. Fatal to the current instance.
#[derive(thiserror::Error, Debug, Clone)]
#[error("CVR ownership lost to a newer owner as of {takeover_time_ms}")]
pub struct OwnershipLost {
    pub takeover_time_ms: i64,
}

/// Two updaters raced to flush against the same base CVR version. The
/// View Syncer treats this as fatal to the service.
#[derive(thiserror::Error, Debug, Clone)]
#[error("CVR flush conflict: base version was no longer current")]
pub struct FlushConflict;

/// Pulls an `ErrorMetadata` back out of an `anyhow::Error` chain, if
/// present, so a caller can decide per-client vs per-group handling.
pub fn downcast_metadata(err: &anyhow::Error) -> Option<&ErrorMetadata> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

pub fn is_reset_pipelines(err: &anyhow::Error) -> Option<&ResetPipelinesSignal> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

pub fn is_ownership_lost(err: &anyhow::Error) -> Option<&OwnershipLost> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_message_has_expected_wording() {
        let e = ErrorMetadata::schema_version_not_supported(Some(2), 3, 3);
        assert_eq!(
            e.msg,
            "Schema version 2 is not in range of supported schema versions [3, 3]."
        );
    }

    #[test]
    fn downcast_finds_metadata_through_context() {
        let base = anyhow::Error::new(ErrorMetadata::unauthorized("no token"));
        let wrapped = base.context("while authenticating");
        let found = downcast_metadata(&wrapped).unwrap();
        assert_eq!(found.kind, ErrorKind::Unauthorized);
    }

    #[test]
    fn downcast_finds_reset_signal() {
        let err = anyhow::Error::new(ResetPipelinesSignal("ddl change".to_string()))
            .context("advancing");
        assert!(is_reset_pipelines(&err).is_some());
        assert!(is_ownership_lost(&err).is_none());
    }
}
