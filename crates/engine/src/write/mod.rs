//! The write coordinator
//!
//! Every logical write runs in exactly one store transaction, in a fixed
//! order: authorization, version check, validation, quota, mutation,
//! version stamp, commit. Any error drops the transaction and leaves no
//! trace. A stale version token is not an error: the write is skipped and
//! the current entity is handed back in a [`WriteOutcome`].

mod one_shot;
mod resource;
mod tenant;

use chrono::{DateTime, Utc};

use crate::access::Claim;
use crate::config::EngineConfig;
use crate::crypto::CapabilityKey;
use crate::error::Result;
use crate::model::{Capability, CapabilityId, ResourceId, TenantId};

pub use resource::{EdgesUpdate, NewResource, ResourceUpdate, SweepReport, TagsUpdate};
pub use tenant::{NewTenant, TenantUpdate};

/// Result of a write guarded by a version token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome<T> {
    /// `false` when the presented token was stale and nothing was written
    pub write_ok: bool,
    /// The entity as stored after the call
    pub entity: T,
}

impl<T> WriteOutcome<T> {
    pub(crate) fn written(entity: T) -> Self {
        Self {
            write_ok: true,
            entity,
        }
    }

    pub(crate) fn stale(entity: T) -> Self {
        Self {
            write_ok: false,
            entity,
        }
    }
}

/// A capability to issue alongside a tenant or resource write
#[derive(Debug, Clone)]
pub struct NewCapability {
    /// The key holders will present
    pub key: CapabilityKey,
    pub claim: Claim,
    /// Defaults to the time of the write
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl NewCapability {
    pub fn new(key: CapabilityKey, claim: Claim) -> Self {
        Self {
            key,
            claim,
            start: None,
            stop: None,
        }
    }

    pub fn valid_between(mut self, start: DateTime<Utc>, stop: Option<DateTime<Utc>>) -> Self {
        self.start = Some(start);
        self.stop = stop;
        self
    }

    /// Validate and seal the claim for `tenant`
    pub(crate) fn seal(
        &self,
        config: &EngineConfig,
        tenant: TenantId,
        resource: Option<ResourceId>,
        now: DateTime<Utc>,
    ) -> Result<Capability> {
        self.claim.validate(&config.forced_group_empty)?;
        let (nonce, ciphertext) = self
            .key
            .seal(&self.claim.to_vec()?, tenant.as_uuid().as_bytes())?;
        Ok(Capability {
            id: CapabilityId::generate(),
            tenant,
            resource,
            key_digest: config.newest_digest().digest(self.key.bytes()),
            nonce,
            ciphertext,
            start: self.start.unwrap_or(now),
            stop: self.stop,
            used: None,
        })
    }
}
