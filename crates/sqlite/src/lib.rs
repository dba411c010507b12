//! SQLite backend for the capability engine
//!
//! [`SqliteStore`] implements the engine's
//! [`StoreProvider`](engine::store::StoreProvider). Readers borrow a pooled
//! connection; writers open a transaction and hold a process-wide write
//! lock, so two writers never interleave. Dropping a writer rolls its
//! transaction back.
//!
//! Timestamps are stored as unix milliseconds.

mod error;
mod queries;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use engine::model::{
    Capability, CapabilityId, Edge, Pool, PoolId, Resource, ResourceId, Tenant, TenantId,
};
use engine::store::{CapabilityQuery, StoreError, StoreProvider, StoreRead, StoreWrite};

pub use error::{Result, SqliteStoreError};

use queries::db_error;

/// SQLite store provider.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        tracing::info!("opened sqlite store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory database.
    ///
    /// Every connection to `:memory:` is its own database, so the pool keeps
    /// exactly one connection open for its whole life.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct SqliteReader(PoolConnection<Sqlite>);

pub struct SqliteWriter {
    tx: Transaction<'static, Sqlite>,
    _lock: OwnedMutexGuard<()>,
}

impl SqliteReader {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.0
    }
}

impl SqliteWriter {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl StoreProvider for SqliteStore {
    type Reader = SqliteReader;
    type Writer = SqliteWriter;

    async fn reader(&self) -> std::result::Result<Self::Reader, StoreError> {
        let conn = self.pool.acquire().await.map_err(db_error)?;
        Ok(SqliteReader(conn))
    }

    async fn writer(&self) -> std::result::Result<Self::Writer, StoreError> {
        let lock = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(SqliteWriter { tx, _lock: lock })
    }
}

macro_rules! impl_sqlite_read {
    ($ty:ty) => {
        #[async_trait]
        impl StoreRead for $ty {
            async fn pool(&mut self, id: PoolId) -> std::result::Result<Option<Pool>, StoreError> {
                queries::pool(self.conn(), id).await
            }

            async fn tenant(
                &mut self,
                id: TenantId,
            ) -> std::result::Result<Option<Tenant>, StoreError> {
                queries::tenant(self.conn(), id).await
            }

            async fn tenant_by_name(
                &mut self,
                name: &str,
            ) -> std::result::Result<Option<Tenant>, StoreError> {
                queries::tenant_by_name(self.conn(), name).await
            }

            async fn resource(
                &mut self,
                id: ResourceId,
            ) -> std::result::Result<Option<Resource>, StoreError> {
                queries::resource(self.conn(), id).await
            }

            async fn resource_by_hash(
                &mut self,
                tenant: TenantId,
                hash: &str,
            ) -> std::result::Result<Option<Resource>, StoreError> {
                queries::resource_by_hash(self.conn(), tenant, hash).await
            }

            async fn resources_of_tenant(
                &mut self,
                tenant: TenantId,
            ) -> std::result::Result<Vec<Resource>, StoreError> {
                queries::resources_of_tenant(self.conn(), tenant).await
            }

            async fn resources_due(
                &mut self,
                cutoff: DateTime<Utc>,
            ) -> std::result::Result<Vec<ResourceId>, StoreError> {
                queries::resources_due(self.conn(), cutoff).await
            }

            async fn tenants_due(
                &mut self,
                cutoff: DateTime<Utc>,
            ) -> std::result::Result<Vec<TenantId>, StoreError> {
                queries::tenants_due(self.conn(), cutoff).await
            }

            async fn edges_from(
                &mut self,
                source: ResourceId,
            ) -> std::result::Result<Vec<Edge>, StoreError> {
                queries::edges_from(self.conn(), source).await
            }

            async fn edges_to(
                &mut self,
                target: ResourceId,
            ) -> std::result::Result<Vec<Edge>, StoreError> {
                queries::edges_to(self.conn(), target).await
            }

            async fn capability_links(
                &mut self,
                resource: ResourceId,
            ) -> std::result::Result<BTreeSet<CapabilityId>, StoreError> {
                queries::capability_links(self.conn(), resource).await
            }

            async fn capability(
                &mut self,
                id: CapabilityId,
            ) -> std::result::Result<Option<Capability>, StoreError> {
                queries::capability(self.conn(), id).await
            }

            async fn capabilities(
                &mut self,
                query: CapabilityQuery<'_>,
            ) -> std::result::Result<Vec<Capability>, StoreError> {
                queries::capabilities(self.conn(), query).await
            }

            async fn capabilities_of_tenant(
                &mut self,
                tenant: TenantId,
            ) -> std::result::Result<Vec<Capability>, StoreError> {
                queries::capabilities_of_tenant(self.conn(), tenant).await
            }
        }
    };
}

impl_sqlite_read!(SqliteReader);
impl_sqlite_read!(SqliteWriter);

#[async_trait]
impl StoreWrite for SqliteWriter {
    async fn insert_pool(&mut self, pool: &Pool) -> std::result::Result<(), StoreError> {
        queries::insert_pool(self.conn(), pool).await
    }

    async fn adjust_pool_usage(
        &mut self,
        id: PoolId,
        delta: i64,
        enforce_quota: bool,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<u64>, StoreError> {
        queries::adjust_pool_usage(self.conn(), id, delta, enforce_quota, now).await
    }

    async fn put_tenant(&mut self, tenant: &Tenant) -> std::result::Result<(), StoreError> {
        queries::put_tenant(self.conn(), tenant).await
    }

    async fn delete_tenant(&mut self, id: TenantId) -> std::result::Result<(), StoreError> {
        queries::delete_tenant(self.conn(), id).await
    }

    async fn put_resource(&mut self, resource: &Resource) -> std::result::Result<(), StoreError> {
        queries::put_resource(self.conn(), resource).await
    }

    async fn delete_resource(&mut self, id: ResourceId) -> std::result::Result<(), StoreError> {
        queries::delete_resource(self.conn(), id).await
    }

    async fn replace_edges(
        &mut self,
        source: ResourceId,
        edges: &[Edge],
    ) -> std::result::Result<(), StoreError> {
        queries::replace_edges(self.conn(), source, edges).await
    }

    async fn put_capability(
        &mut self,
        capability: &Capability,
    ) -> std::result::Result<(), StoreError> {
        queries::put_capability(self.conn(), capability).await
    }

    async fn delete_capability(&mut self, id: CapabilityId) -> std::result::Result<(), StoreError> {
        queries::delete_capability(self.conn(), id).await
    }

    async fn set_capability_digest(
        &mut self,
        id: CapabilityId,
        digest: &str,
    ) -> std::result::Result<(), StoreError> {
        queries::set_capability_digest(self.conn(), id, digest).await
    }

    async fn set_capability_used(
        &mut self,
        id: CapabilityId,
        used: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), StoreError> {
        queries::set_capability_used(self.conn(), id, used).await
    }

    async fn commit(self) -> std::result::Result<(), StoreError> {
        self.tx.commit().await.map_err(db_error)
    }
}
