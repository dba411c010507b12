use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PoolId, ResourceId, TenantId, VersionToken};
use super::tag::{Tag, FROZEN_TAG, IMMUTABLE_TAG};

/// Well-known resource states. Any other string is accepted as well.
pub mod states {
    pub const PUBLIC: &str = "public";
    pub const PROTECTED: &str = "protected";
    pub const DRAFT: &str = "draft";
    pub const SENSITIVE: &str = "sensitive";
}

/// A stored, content-addressed item.
///
/// The payload is opaque ciphertext: the engine only accounts for its size.
/// Outgoing edges are kept by the store next to the resource, not inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub tenant: TenantId,
    pub pool: PoolId,
    pub type_name: String,
    pub state: String,
    pub payload: Vec<u8>,
    /// Unique per tenant
    pub content_hash: String,
    pub tags: BTreeSet<Tag>,
    pub version: VersionToken,
    pub destroy_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// Locked resources refuse every update until the lock tag is removed
    pub fn is_locked(&self) -> bool {
        self.tags
            .iter()
            .any(|tag| tag.as_str() == FROZEN_TAG || tag.as_str() == IMMUTABLE_TAG)
    }

    pub fn is_marked_for_destruction(&self) -> bool {
        self.destroy_at.is_some()
    }
}
