use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CapabilityId, ResourceId, TenantId};

/// An issued, encrypted permission bound to a tenant.
///
/// The claim inside `ciphertext` can only be read by somebody holding the
/// symmetric key whose digest is `key_digest`. A capability joined to a
/// `resource` only ever speaks for that resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub tenant: TenantId,
    pub resource: Option<ResourceId>,
    /// `<algorithm>:<base64 digest>` of the symmetric key
    pub key_digest: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
    /// Set once a one-shot capability has been exercised
    pub used: Option<DateTime<Utc>>,
}

impl Capability {
    /// Whether the validity window covers `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && self.stop.map(|stop| now < stop).unwrap_or(true)
    }
}
