//! Error taxonomy
//!
//! Reconcilers return `anyhow::Result`; the controller manager classifies
//! the typed errors in the chain to pick a retry policy.

use thiserror::Error;

use crate::api::{Kind, ObjectKey};

/// Resource store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: Kind, key: ObjectKey },
    #[error("conflict updating {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: Kind,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },
    #[error("failed to encode {kind}: {source}")]
    Codec {
        kind: Kind,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// How the runtime treats a failed reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Referenced object is missing; it may still be created
    NotFound,
    /// Stored or received data that cannot be decoded; retrying cannot help
    Malformed,
    /// Backend or remote call failed
    Transport,
    /// Optimistic concurrency mismatch; re-read and retry immediately
    Conflict,
}

impl ErrorClass {
    /// Whether the runtime should retry without operator action
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Malformed)
    }
}

/// Classify an error chain by the typed errors it carries
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return match store {
                StoreError::NotFound { .. } => ErrorClass::NotFound,
                StoreError::Conflict { .. } => ErrorClass::Conflict,
                StoreError::Codec { .. } => ErrorClass::Malformed,
                StoreError::AlreadyExists { .. } | StoreError::Backend(_) => ErrorClass::Transport,
            };
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return ErrorClass::Malformed;
        }
    }
    ErrorClass::Transport
}
