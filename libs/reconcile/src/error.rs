//! Error types for the reconciliation engine and store adapters.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a [`ResourceStore`](crate::ResourceStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Create collided with an existing object.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Kind was never registered with the store's type registry.
    #[error("unknown kind: {0}")]
    UnknownKind(String),

    /// Malformed `namespace/name` key.
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Object could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors that stop the reconciliation engine.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Caches did not report synchronized within the startup bound.
    #[error("timed out after {elapsed:?} waiting for caches to sync: {pending:?}")]
    CacheSyncTimeout {
        elapsed: Duration,
        pending: Vec<&'static str>,
    },

    /// Shutdown was signalled before the caches synced.
    #[error("shutdown requested before caches synced")]
    ShutdownBeforeSync,

    /// A kind was registered twice on the same controller.
    #[error("kind {0} is already registered on this controller")]
    DuplicateKind(&'static str),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
