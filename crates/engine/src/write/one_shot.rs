use chrono::Utc;

use crate::access::{AccessResult, Compensation, EvaluationContext, Subject};
use crate::engine::Engine;
use crate::error::Result;
use crate::model::{CapabilityId, ResourceId, Tag, TenantId, VersionToken, FROZEN_TAG};
use crate::store::{StoreProvider, StoreRead, StoreWrite};

impl<S: StoreProvider> Engine<S> {
    /// Apply the side effects of the one-shot and freezing grants in `access`
    ///  to the `resources` a request served
    ///
    /// Each marker is committed on its own, so concurrent readers see it
    /// right away, and is recorded in `ctx` so [`Engine::abort`] can take
    /// it back.
    pub async fn exercise(
        &self,
        ctx: &mut EvaluationContext,
        access: &AccessResult,
        resources: &[ResourceId],
    ) -> Result<()> {
        let exercises: Vec<_> = access.exercises().collect();
        for (tenant, capability, exercise) in exercises {
            if exercise.freeze {
                for resource in resources {
                    if self.freeze(access, tenant, capability, *resource).await? {
                        ctx.record(Compensation::Unfreeze(*resource));
                    }
                }
            }
            if exercise.consume && self.consume(capability).await? {
                ctx.record(Compensation::ReleaseCapability(capability));
            }
        }
        ctx.invalidate();
        Ok(())
    }

    async fn consume(&self, id: CapabilityId) -> Result<bool> {
        let mut writer = self.store().writer().await?;
        match writer.capability(id).await? {
            Some(capability) if capability.used.is_none() => {
                writer.set_capability_used(id, Some(Utc::now())).await?;
                writer.commit().await?;
                tracing::debug!("capability {} used up", id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Tag a resource served under `capability` as frozen
    async fn freeze(
        &self,
        access: &AccessResult,
        tenant: TenantId,
        capability: CapabilityId,
        id: ResourceId,
    ) -> Result<bool> {
        let mut writer = self.store().writer().await?;
        let Some(mut resource) = writer.resource(id).await? else {
            return Ok(false);
        };
        let bound = writer
            .capability(capability)
            .await?
            .and_then(|capability| capability.resource);
        if resource.tenant != tenant || bound.map(|bound| bound != id).unwrap_or(false) {
            return Ok(false);
        }
        let links = writer.capability_links(id).await?;
        let covered = access
            .tenant(tenant)
            .map(|grant| grant.predicate.matches(&Subject::resource(&resource, &links)))
            .unwrap_or(false);
        let frozen = Tag::parse(FROZEN_TAG)?;
        if !covered || resource.tags.contains(&frozen) {
            return Ok(false);
        }

        let size = frozen.len() as i64;
        resource.tags.insert(frozen);
        resource.version = VersionToken::fresh();
        writer.put_resource(&resource).await?;
        // the lock tag is charged, but never refused for quota
        writer
            .adjust_pool_usage(resource.pool, size, false, Utc::now())
            .await?;
        writer.commit().await?;
        tracing::debug!("resource {} frozen by capability {}", id, capability);
        Ok(true)
    }
}
