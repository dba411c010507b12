use crate::access::ClaimError;
use crate::model::{ResourceId, TagError};
use crate::store::StoreError;

/// Errors surfaced by engine operations
///
/// Everything here aborts the surrounding write transaction. Conditions that
/// only make a capability not apply (bad tokens, failed decryption, unknown
/// claim kinds) never become an `EngineError`; a stale version token is not
/// an error either, see [`WriteOutcome`](crate::write::WriteOutcome).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A structural rule of the graph or of tags would be broken
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Quota, upload cap or inactive pool
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    #[error("resource is locked: {0}")]
    Locked(ResourceId),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),
    #[error("key error: {0}")]
    Key(#[from] crate::crypto::KeyError),
}

impl From<TagError> for EngineError {
    fn from(err: TagError) -> Self {
        EngineError::InvariantViolation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
