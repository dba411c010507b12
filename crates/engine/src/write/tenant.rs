use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use crate::access::{EvaluationContext, Scope, Subject, TargetKind};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::model::{Pool, PoolId, Tenant, TenantId, VersionToken};
use crate::store::{StoreError, StoreProvider, StoreRead, StoreWrite};

use super::{NewCapability, WriteOutcome};

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub pool: PoolId,
    pub name: Option<String>,
    pub public: bool,
    /// Tenant-wide capabilities to issue
    pub capabilities: Vec<NewCapability>,
}

impl NewTenant {
    pub fn new(pool: PoolId) -> Self {
        Self {
            pool,
            name: None,
            public: false,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: NewCapability) -> Self {
        self.capabilities.push(capability);
        self
    }
}

/// Changes to a tenant; `None` fields stay as they are
#[derive(Debug, Clone)]
pub struct TenantUpdate {
    pub expected_version: VersionToken,
    pub name: Option<String>,
    pub public: Option<bool>,
    /// Replaces every tenant-wide capability, needs the manage scope
    pub capabilities: Option<Vec<NewCapability>>,
}

impl TenantUpdate {
    pub fn new(expected_version: VersionToken) -> Self {
        Self {
            expected_version,
            name: None,
            public: None,
            capabilities: None,
        }
    }
}

fn conflict_as_violation(err: StoreError) -> EngineError {
    match err {
        StoreError::Conflict(msg) => EngineError::InvariantViolation(msg),
        other => other.into(),
    }
}

impl<S: StoreProvider> Engine<S> {
    pub async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        let mut writer = self.store().writer().await?;
        writer.insert_pool(&pool).await.map_err(conflict_as_violation)?;
        writer.commit().await?;
        tracing::debug!("created pool {}", pool.id);
        Ok(pool)
    }

    /// Register a tenant; who may register is decided outside the engine
    pub async fn create_tenant(
        &self,
        ctx: &mut EvaluationContext,
        new: NewTenant,
    ) -> Result<Tenant> {
        let now = Utc::now();
        let mut writer = self.store().writer().await?;
        let pool = writer
            .pool(new.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", new.pool)))?;
        if !pool.active {
            return Err(EngineError::ResourceLimitExceeded(format!(
                "pool {} is inactive",
                pool.id
            )));
        }

        let mut tenant = Tenant::new(pool.id);
        tenant.name = new.name;
        tenant.public = new.public;
        writer.put_tenant(&tenant).await.map_err(conflict_as_violation)?;
        for capability in &new.capabilities {
            let sealed = capability.seal(self.config(), tenant.id, None, now)?;
            writer.put_capability(&sealed).await?;
        }
        writer.commit().await?;
        ctx.invalidate();
        tracing::info!("created tenant {}", tenant.id);
        Ok(tenant)
    }

    pub async fn update_tenant(
        &self,
        ctx: &mut EvaluationContext,
        id: TenantId,
        update: TenantUpdate,
    ) -> Result<WriteOutcome<Tenant>> {
        let queried: BTreeSet<Uuid> = [id.as_uuid()].into();
        let update_access = if update.name.is_some() || update.public.is_some() {
            Some(
                self.evaluate(ctx, Scope::Update, TargetKind::Tenant, Some(&queried))
                    .await?,
            )
        } else {
            None
        };
        let manage_access = if update.capabilities.is_some() {
            Some(
                self.evaluate(ctx, Scope::Manage, TargetKind::Tenant, Some(&queried))
                    .await?,
            )
        } else {
            None
        };

        let now = Utc::now();
        let mut writer = self.store().writer().await?;
        let mut tenant = writer
            .tenant(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tenant {}", id)))?;
        for access in update_access.iter().chain(manage_access.iter()) {
            if !access.permits(&Subject::tenant(&tenant)) {
                return Err(EngineError::PermissionDenied(format!(
                    "no {} access to tenant {}",
                    access.scope, id
                )));
            }
        }
        if tenant.version != update.expected_version {
            return Ok(WriteOutcome::stale(tenant));
        }

        if let Some(name) = update.name {
            tenant.name = Some(name);
        }
        if let Some(public) = update.public {
            tenant.public = public;
        }
        tenant.version = VersionToken::fresh();
        writer.put_tenant(&tenant).await.map_err(conflict_as_violation)?;

        if let Some(capabilities) = update.capabilities {
            for old in writer.capabilities_of_tenant(id).await? {
                if old.resource.is_none() {
                    writer.delete_capability(old.id).await?;
                }
            }
            for capability in &capabilities {
                let sealed = capability.seal(self.config(), id, None, now)?;
                writer.put_capability(&sealed).await?;
            }
        }
        writer.commit().await?;
        ctx.invalidate();
        Ok(WriteOutcome::written(tenant))
    }

    /// Mark a tenant for destruction; the sweep removes it after the grace
    ///  window
    pub async fn delete_tenant(&self, ctx: &mut EvaluationContext, id: TenantId) -> Result<Tenant> {
        let queried: BTreeSet<Uuid> = [id.as_uuid()].into();
        let access = self
            .evaluate(ctx, Scope::Manage, TargetKind::Tenant, Some(&queried))
            .await?;

        let mut writer = self.store().writer().await?;
        let mut tenant = writer
            .tenant(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tenant {}", id)))?;
        if !access.permits(&Subject::tenant(&tenant)) {
            return Err(EngineError::PermissionDenied(format!(
                "no manage access to tenant {}",
                id
            )));
        }
        tenant.destroy_at = Some(self.config().destruction_deadline(Utc::now()));
        tenant.version = VersionToken::fresh();
        writer.put_tenant(&tenant).await?;
        writer.commit().await?;
        ctx.invalidate();
        tracing::info!("tenant {} marked for destruction", id);
        Ok(tenant)
    }
}
