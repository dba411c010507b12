//! Shared setup for engine integration tests
#![allow(dead_code)]

use engine::access::ManageClaim;
use engine::prelude::*;
use engine::store::MemoryStore;
use tracing_subscriber::EnvFilter;

/// Log to the test writer, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An engine over a memory store with one pool and one tenant, owned
///  through a manage capability
pub struct Fixture {
    pub engine: Engine<MemoryStore>,
    pub pool: Pool,
    pub tenant: Tenant,
    pub manage_key: CapabilityKey,
    issued: Vec<NewCapability>,
}

pub async fn setup() -> Fixture {
    setup_with(Pool::new(None), EngineConfig::default()).await
}

pub async fn setup_with(pool: Pool, config: EngineConfig) -> Fixture {
    init_tracing();
    let engine = Engine::new(MemoryStore::new(), config);
    let pool = engine.create_pool(pool).await.unwrap();
    let manage_key = CapabilityKey::generate();
    let manage = NewCapability::new(manage_key.clone(), Claim::Manage(ManageClaim::default()));

    let mut ctx = engine.context(Vec::<String>::new());
    let tenant = engine
        .create_tenant(&mut ctx, NewTenant::new(pool.id).with_capability(manage.clone()))
        .await
        .unwrap();
    engine.finish(ctx).await;

    Fixture {
        engine,
        pool,
        tenant,
        manage_key,
        issued: vec![manage],
    }
}

impl Fixture {
    /// A request authorized with the manage key and `extra` keys
    pub fn owner(&self, extra: &[&CapabilityKey]) -> EvaluationContext {
        let mut entries = vec![authorization_entry(self.tenant.id, &self.manage_key)];
        entries.extend(extra.iter().map(|key| authorization_entry(self.tenant.id, key)));
        self.engine.context(entries)
    }

    /// A request authorized with `keys` only
    pub fn holder(&self, keys: &[&CapabilityKey]) -> EvaluationContext {
        self.engine.context(
            keys.iter()
                .map(|key| authorization_entry(self.tenant.id, key))
                .collect::<Vec<_>>(),
        )
    }

    /// Issue one more tenant-wide capability, keeping the ones issued before
    pub async fn issue(&mut self, claim: Claim) -> CapabilityKey {
        let key = CapabilityKey::generate();
        self.issued.push(NewCapability::new(key.clone(), claim));

        let mut ctx = self.owner(&[]);
        let update = TenantUpdate {
            capabilities: Some(self.issued.clone()),
            ..TenantUpdate::new(self.tenant().await.version)
        };
        let outcome = self
            .engine
            .update_tenant(&mut ctx, self.tenant.id, update)
            .await
            .unwrap();
        assert!(outcome.write_ok);
        self.tenant = outcome.entity;
        self.engine.finish(ctx).await;
        key
    }

    pub async fn tenant(&self) -> Tenant {
        let mut reader = self.engine.store().reader().await.unwrap();
        reader.tenant(self.tenant.id).await.unwrap().unwrap()
    }

    pub async fn pool_usage(&self, pool: PoolId) -> u64 {
        let mut reader = self.engine.store().reader().await.unwrap();
        reader.pool(pool).await.unwrap().unwrap().bytes_in_use
    }

    pub async fn resource(&self, id: ResourceId) -> Option<Resource> {
        let mut reader = self.engine.store().reader().await.unwrap();
        reader.resource(id).await.unwrap()
    }

    pub async fn edges_from(&self, id: ResourceId) -> Vec<Edge> {
        let mut reader = self.engine.store().reader().await.unwrap();
        reader.edges_from(id).await.unwrap()
    }

    /// Create a resource as the owner
    pub async fn create(&self, new: NewResource) -> Resource {
        self.try_create(new).await.unwrap()
    }

    pub async fn try_create(&self, new: NewResource) -> Result<Resource> {
        let mut ctx = self.owner(&[]);
        let result = self.engine.create_resource(&mut ctx, new).await;
        self.engine.finish(ctx).await;
        result
    }

    /// A protected resource of `type_name` with a unique content hash
    pub fn new_resource(&self, type_name: &str, payload: &[u8]) -> NewResource {
        NewResource::new(
            self.tenant.id,
            type_name,
            format!("hash-{}", uuid::Uuid::new_v4()),
            payload.to_vec(),
        )
    }

    /// Mark `id` for destruction and run a sweep past the grace window
    pub async fn destroy(&self, id: ResourceId, extra: &[&CapabilityKey]) {
        let mut ctx = self.owner(extra);
        self.engine.delete_resource(&mut ctx, id).await.unwrap();
        self.engine.finish(ctx).await;
        let later = chrono::Utc::now()
            + chrono::Duration::seconds(self.engine.config().destruction_grace_secs as i64 + 1);
        self.engine.sweep(later).await.unwrap();
    }

    /// Bytes `resource` occupies with its current edges
    pub async fn footprint(&self, resource: &Resource) -> u64 {
        let edges = self.edges_from(resource.id).await;
        engine::quota::footprint(resource, &edges, self.engine.config().edge_overhead)
    }
}
