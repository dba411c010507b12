use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::provider::{CapabilityQuery, StoreError, StoreProvider, StoreRead, StoreWrite};
use crate::model::{
    Capability, CapabilityId, Edge, Pool, PoolId, Resource, ResourceId, Tenant, TenantId,
};

/// In-memory store provider using ordered maps
///
/// Writers take the lock exclusively and keep a snapshot of the state they
/// started from, which is restored if they are dropped without committing.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    pools: BTreeMap<PoolId, Pool>,
    tenants: BTreeMap<TenantId, Tenant>,
    resources: BTreeMap<ResourceId, Resource>,
    /// (source, target, group) -> edge
    edges: BTreeMap<(ResourceId, ResourceId, String), Edge>,
    capabilities: BTreeMap<CapabilityId, Capability>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryReader(OwnedRwLockReadGuard<MemoryState>);

pub struct MemoryWriter {
    guard: OwnedRwLockWriteGuard<MemoryState>,
    // state to restore on drop, cleared by commit
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn reader(&self) -> Result<Self::Reader, StoreError> {
        Ok(MemoryReader(self.inner.clone().read_owned().await))
    }

    async fn writer(&self) -> Result<Self::Writer, StoreError> {
        let guard = self.inner.clone().write_owned().await;
        let snapshot = Some(guard.clone());
        Ok(MemoryWriter { guard, snapshot })
    }
}

impl MemoryState {
    fn resource_by_hash(&self, tenant: TenantId, hash: &str) -> Option<Resource> {
        self.resources
            .values()
            .find(|r| r.tenant == tenant && r.content_hash == hash)
            .cloned()
    }

    fn edges_to(&self, target: ResourceId) -> Vec<Edge> {
        self.edges
            .values()
            .filter(|e| e.target == target)
            .cloned()
            .collect()
    }

    fn edges_from(&self, source: ResourceId) -> Vec<Edge> {
        self.edges
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }
}

macro_rules! impl_memory_read {
    ($ty:ty) => {
        #[async_trait]
        impl StoreRead for $ty {
            async fn pool(&mut self, id: PoolId) -> Result<Option<Pool>, StoreError> {
                Ok(self.state().pools.get(&id).cloned())
            }

            async fn tenant(&mut self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
                Ok(self.state().tenants.get(&id).cloned())
            }

            async fn tenant_by_name(&mut self, name: &str) -> Result<Option<Tenant>, StoreError> {
                Ok(self
                    .state()
                    .tenants
                    .values()
                    .find(|t| t.name.as_deref() == Some(name))
                    .cloned())
            }

            async fn resource(&mut self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
                Ok(self.state().resources.get(&id).cloned())
            }

            async fn resource_by_hash(
                &mut self,
                tenant: TenantId,
                hash: &str,
            ) -> Result<Option<Resource>, StoreError> {
                Ok(self.state().resource_by_hash(tenant, hash))
            }

            async fn resources_of_tenant(
                &mut self,
                tenant: TenantId,
            ) -> Result<Vec<Resource>, StoreError> {
                Ok(self
                    .state()
                    .resources
                    .values()
                    .filter(|r| r.tenant == tenant)
                    .cloned()
                    .collect())
            }

            async fn resources_due(
                &mut self,
                cutoff: DateTime<Utc>,
            ) -> Result<Vec<ResourceId>, StoreError> {
                Ok(self
                    .state()
                    .resources
                    .values()
                    .filter(|r| r.destroy_at.map(|at| at <= cutoff).unwrap_or(false))
                    .map(|r| r.id)
                    .collect())
            }

            async fn tenants_due(
                &mut self,
                cutoff: DateTime<Utc>,
            ) -> Result<Vec<TenantId>, StoreError> {
                Ok(self
                    .state()
                    .tenants
                    .values()
                    .filter(|t| t.destroy_at.map(|at| at <= cutoff).unwrap_or(false))
                    .map(|t| t.id)
                    .collect())
            }

            async fn edges_from(&mut self, source: ResourceId) -> Result<Vec<Edge>, StoreError> {
                Ok(self.state().edges_from(source))
            }

            async fn edges_to(&mut self, target: ResourceId) -> Result<Vec<Edge>, StoreError> {
                Ok(self.state().edges_to(target))
            }

            async fn capability_links(
                &mut self,
                resource: ResourceId,
            ) -> Result<BTreeSet<CapabilityId>, StoreError> {
                Ok(self
                    .state()
                    .capabilities
                    .values()
                    .filter(|c| c.resource == Some(resource))
                    .map(|c| c.id)
                    .collect())
            }

            async fn capability(
                &mut self,
                id: CapabilityId,
            ) -> Result<Option<Capability>, StoreError> {
                Ok(self.state().capabilities.get(&id).cloned())
            }

            async fn capabilities(
                &mut self,
                query: CapabilityQuery<'_>,
            ) -> Result<Vec<Capability>, StoreError> {
                Ok(self
                    .state()
                    .capabilities
                    .values()
                    .filter(|c| query.matches(c))
                    .cloned()
                    .collect())
            }

            async fn capabilities_of_tenant(
                &mut self,
                tenant: TenantId,
            ) -> Result<Vec<Capability>, StoreError> {
                Ok(self
                    .state()
                    .capabilities
                    .values()
                    .filter(|c| c.tenant == tenant)
                    .cloned()
                    .collect())
            }
        }
    };
}

impl MemoryReader {
    fn state(&self) -> &MemoryState {
        &self.0
    }
}

impl MemoryWriter {
    fn state(&self) -> &MemoryState {
        &self.guard
    }

    fn state_mut(&mut self) -> &mut MemoryState {
        &mut self.guard
    }
}

impl_memory_read!(MemoryReader);
impl_memory_read!(MemoryWriter);

#[async_trait]
impl StoreWrite for MemoryWriter {
    async fn insert_pool(&mut self, pool: &Pool) -> Result<(), StoreError> {
        let state = self.state_mut();
        if state.pools.contains_key(&pool.id) {
            return Err(StoreError::Conflict(format!("pool {} exists", pool.id)));
        }
        state.pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn adjust_pool_usage(
        &mut self,
        id: PoolId,
        delta: i64,
        enforce_quota: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        let pool = self
            .state_mut()
            .pools
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("pool {}", id)))?;
        if enforce_quota && !pool.admits(delta) {
            return Ok(None);
        }
        pool.bytes_in_use = if delta >= 0 {
            pool.bytes_in_use.saturating_add(delta as u64)
        } else {
            pool.bytes_in_use.saturating_sub(delta.unsigned_abs())
        };
        pool.last_used = Some(now);
        Ok(Some(pool.bytes_in_use))
    }

    async fn put_tenant(&mut self, tenant: &Tenant) -> Result<(), StoreError> {
        let state = self.state_mut();
        if let Some(name) = tenant.name.as_deref() {
            let taken = state
                .tenants
                .values()
                .any(|t| t.id != tenant.id && t.name.as_deref() == Some(name));
            if taken {
                return Err(StoreError::Conflict(format!("tenant name {} taken", name)));
            }
        }
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&mut self, id: TenantId) -> Result<(), StoreError> {
        let state = self.state_mut();
        state.tenants.remove(&id);
        state.capabilities.retain(|_, c| c.tenant != id);
        Ok(())
    }

    async fn put_resource(&mut self, resource: &Resource) -> Result<(), StoreError> {
        let state = self.state_mut();
        if let Some(existing) = state.resource_by_hash(resource.tenant, &resource.content_hash) {
            if existing.id != resource.id {
                return Err(StoreError::Conflict(format!(
                    "content hash {} exists in tenant {}",
                    resource.content_hash, resource.tenant
                )));
            }
        }
        state.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn delete_resource(&mut self, id: ResourceId) -> Result<(), StoreError> {
        let state = self.state_mut();
        state.resources.remove(&id);
        state.edges.retain(|_, e| e.source != id && e.target != id);
        state.capabilities.retain(|_, c| c.resource != Some(id));
        Ok(())
    }

    async fn replace_edges(
        &mut self,
        source: ResourceId,
        edges: &[Edge],
    ) -> Result<(), StoreError> {
        let state = self.state_mut();
        state.edges.retain(|_, e| e.source != source);
        for edge in edges {
            state
                .edges
                .insert((edge.source, edge.target, edge.group.clone()), edge.clone());
        }
        Ok(())
    }

    async fn put_capability(&mut self, capability: &Capability) -> Result<(), StoreError> {
        self.state_mut()
            .capabilities
            .insert(capability.id, capability.clone());
        Ok(())
    }

    async fn delete_capability(&mut self, id: CapabilityId) -> Result<(), StoreError> {
        self.state_mut().capabilities.remove(&id);
        Ok(())
    }

    async fn set_capability_digest(
        &mut self,
        id: CapabilityId,
        digest: &str,
    ) -> Result<(), StoreError> {
        if let Some(capability) = self.state_mut().capabilities.get_mut(&id) {
            capability.key_digest = digest.to_string();
        }
        Ok(())
    }

    async fn set_capability_used(
        &mut self,
        id: CapabilityId,
        used: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(capability) = self.state_mut().capabilities.get_mut(&id) {
            capability.used = used;
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_dropped_writer_rolls_back() {
        let store = MemoryStore::new();
        let pool = Pool::new(Some(10));

        let mut writer = store.writer().await.unwrap();
        writer.insert_pool(&pool).await.unwrap();
        drop(writer);

        let mut reader = store.reader().await.unwrap();
        assert!(reader.pool(pool.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_committed_writer_persists() {
        let store = MemoryStore::new();
        let pool = Pool::new(Some(10));

        let mut writer = store.writer().await.unwrap();
        writer.insert_pool(&pool).await.unwrap();
        writer.commit().await.unwrap();

        let mut reader = store.reader().await.unwrap();
        assert_eq!(reader.pool(pool.id).await.unwrap(), Some(pool));
    }

    #[tokio::test]
    async fn test_adjust_pool_usage_respects_quota() {
        let store = MemoryStore::new();
        let pool = Pool::new(Some(10));
        let now = Utc::now();

        let mut writer = store.writer().await.unwrap();
        writer.insert_pool(&pool).await.unwrap();
        assert_eq!(
            writer.adjust_pool_usage(pool.id, 8, true, now).await.unwrap(),
            Some(8)
        );
        assert_eq!(
            writer.adjust_pool_usage(pool.id, 3, true, now).await.unwrap(),
            None
        );
        assert_eq!(
            writer.adjust_pool_usage(pool.id, 3, false, now).await.unwrap(),
            Some(11)
        );
        assert_eq!(
            writer
                .adjust_pool_usage(pool.id, -20, true, now)
                .await
                .unwrap(),
            Some(0)
        );
        writer.commit().await.unwrap();
    }
}
