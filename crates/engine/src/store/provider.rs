use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Capability, CapabilityId, Edge, Pool, PoolId, Resource, ResourceId, Tenant, TenantId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint of the backend was hit
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Which joined capabilities a lookup may return
#[derive(Debug, Clone, Copy)]
pub enum CapabilityBinding<'a> {
    /// Only capabilities not joined to any resource
    TenantWide,
    /// Tenant-wide capabilities, plus those joined to one of the given
    ///  resources (to any resource when `None`)
    Resources(Option<&'a [ResourceId]>),
}

/// Candidate lookup for a presented key
#[derive(Debug, Clone, Copy)]
pub struct CapabilityQuery<'a> {
    pub tenant: TenantId,
    /// Key digests, one per configured algorithm
    pub digests: &'a [String],
    /// Only capabilities whose validity window covers `now` match
    pub now: DateTime<Utc>,
    pub binding: CapabilityBinding<'a>,
}

impl CapabilityQuery<'_> {
    /// Reference implementation of the lookup filter, shared by providers
    ///  that filter in memory
    pub fn matches(&self, capability: &Capability) -> bool {
        if capability.tenant != self.tenant
            || capability.used.is_some()
            || !capability.is_valid_at(self.now)
            || !self.digests.iter().any(|d| *d == capability.key_digest)
        {
            return false;
        }
        match (self.binding, capability.resource) {
            (_, None) => true,
            (CapabilityBinding::TenantWide, Some(_)) => false,
            (CapabilityBinding::Resources(None), Some(_)) => true,
            (CapabilityBinding::Resources(Some(ids)), Some(resource)) => ids.contains(&resource),
        }
    }
}

/// Read access to the persisted entities.
///
/// Reads inside a [`StoreWrite`] see the transaction's own writes.
#[async_trait]
pub trait StoreRead: Send {
    async fn pool(&mut self, id: PoolId) -> Result<Option<Pool>, StoreError>;

    async fn tenant(&mut self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn tenant_by_name(&mut self, name: &str) -> Result<Option<Tenant>, StoreError>;

    async fn resource(&mut self, id: ResourceId) -> Result<Option<Resource>, StoreError>;

    /// Look up a resource by its content hash within one tenant
    async fn resource_by_hash(
        &mut self,
        tenant: TenantId,
        hash: &str,
    ) -> Result<Option<Resource>, StoreError>;

    async fn resources_of_tenant(&mut self, tenant: TenantId)
        -> Result<Vec<Resource>, StoreError>;

    /// Resources whose destruction mark is at or before `cutoff`
    async fn resources_due(&mut self, cutoff: DateTime<Utc>)
        -> Result<Vec<ResourceId>, StoreError>;

    /// Tenants whose destruction mark is at or before `cutoff`
    async fn tenants_due(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<TenantId>, StoreError>;

    async fn edges_from(&mut self, source: ResourceId) -> Result<Vec<Edge>, StoreError>;

    async fn edges_to(&mut self, target: ResourceId) -> Result<Vec<Edge>, StoreError>;

    /// Ids of the capabilities joined to a resource
    async fn capability_links(
        &mut self,
        resource: ResourceId,
    ) -> Result<BTreeSet<CapabilityId>, StoreError>;

    async fn capability(&mut self, id: CapabilityId) -> Result<Option<Capability>, StoreError>;

    /// Candidate capabilities for a presented key
    async fn capabilities(
        &mut self,
        query: CapabilityQuery<'_>,
    ) -> Result<Vec<Capability>, StoreError>;

    /// Every capability of a tenant, joined or not
    async fn capabilities_of_tenant(
        &mut self,
        tenant: TenantId,
    ) -> Result<Vec<Capability>, StoreError>;
}

/// An exclusive write transaction.
///
/// Dropping a writer without calling [`StoreWrite::commit`] discards every
/// change made through it.
#[async_trait]
pub trait StoreWrite: StoreRead + Sized {
    async fn insert_pool(&mut self, pool: &Pool) -> Result<(), StoreError>;

    /// Change a pool's usage in place by `delta` bytes and stamp `last_used`
    ///
    /// With `enforce_quota`, a positive delta that would take usage past the
    /// quota is not applied and `Ok(None)` is returned. Usage never drops
    /// below zero. Returns the new usage otherwise.
    async fn adjust_pool_usage(
        &mut self,
        id: PoolId,
        delta: i64,
        enforce_quota: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError>;

    async fn put_tenant(&mut self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn delete_tenant(&mut self, id: TenantId) -> Result<(), StoreError>;

    /// Insert or replace a resource together with its tag set
    async fn put_resource(&mut self, resource: &Resource) -> Result<(), StoreError>;

    /// Remove a resource, its tags, every edge touching it and the
    ///  capabilities joined to it
    async fn delete_resource(&mut self, id: ResourceId) -> Result<(), StoreError>;

    /// Replace every outgoing edge of `source`
    async fn replace_edges(&mut self, source: ResourceId, edges: &[Edge])
        -> Result<(), StoreError>;

    async fn put_capability(&mut self, capability: &Capability) -> Result<(), StoreError>;

    async fn delete_capability(&mut self, id: CapabilityId) -> Result<(), StoreError>;

    async fn set_capability_digest(
        &mut self,
        id: CapabilityId,
        digest: &str,
    ) -> Result<(), StoreError>;

    async fn set_capability_used(
        &mut self,
        id: CapabilityId,
        used: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// A backend for the engine's entities.
///
/// Think of this as the seam that lets any data store back the engine:
///  - a simple hash map ([`MemoryStore`](super::MemoryStore))
///  - sqlite
#[async_trait]
pub trait StoreProvider: Send + Sync + std::fmt::Debug + Clone + 'static {
    type Reader: StoreRead + 'static;
    type Writer: StoreWrite + 'static;

    /// Open a read-only view
    async fn reader(&self) -> Result<Self::Reader, StoreError>;

    /// Begin an exclusive write transaction
    async fn writer(&self) -> Result<Self::Writer, StoreError>;
}
