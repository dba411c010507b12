use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{DeleteRecursive, ResourceId, TenantId};
use crate::quota;
use crate::store::StoreWrite;

/// Hard delete a resource and everything that depends on it
///
/// Referrers over ALWAYS edges go first. A referrer over GROUP-EMPTY edges
/// goes when one of the groups of those edges holds no other edge of it to a
/// resource that is not being deleted. Resources already in `in_progress`
/// are skipped, which cuts cycles. Returns every deleted id.
pub fn delete_resource<'a, W: StoreWrite>(
    writer: &'a mut W,
    config: &'a EngineConfig,
    id: ResourceId,
    in_progress: &'a mut BTreeSet<ResourceId>,
    now: DateTime<Utc>,
) -> BoxFuture<'a, Result<Vec<ResourceId>>> {
    async move {
        if !in_progress.insert(id) {
            return Ok(Vec::new());
        }
        let Some(resource) = writer.resource(id).await? else {
            return Ok(Vec::new());
        };

        let outgoing = writer.edges_from(id).await?;
        let size = quota::footprint(&resource, &outgoing, config.edge_overhead);

        let mut deleted = Vec::new();
        let referrers = writer.edges_to(id).await?;
        for edge in referrers
            .iter()
            .filter(|edge| edge.delete_recursive == DeleteRecursive::Always)
        {
            deleted.extend(delete_resource(writer, config, edge.source, in_progress, now).await?);
        }

        for edge in referrers
            .iter()
            .filter(|edge| edge.delete_recursive == DeleteRecursive::GroupEmpty)
        {
            if in_progress.contains(&edge.source) {
                continue;
            }
            let outgoing = writer.edges_from(edge.source).await?;
            let all: BTreeSet<&str> = outgoing
                .iter()
                .filter(|e| e.target == id && e.delete_recursive == DeleteRecursive::GroupEmpty)
                .map(|e| e.group.as_str())
                .collect();
            let remaining = all
                .iter()
                .filter(|group| {
                    outgoing.iter().any(|e| {
                        e.group == **group && e.target != id && !in_progress.contains(&e.target)
                    })
                })
                .count();
            if remaining < all.len() {
                deleted.extend(
                    delete_resource(writer, config, edge.source, in_progress, now).await?,
                );
            }
        }

        writer.delete_resource(id).await?;
        quota::release(writer, resource.pool, size, now).await?;
        // surviving referrers lose their edge to us
        for edge in referrers.iter().filter(|e| !in_progress.contains(&e.source)) {
            if let Some(source) = writer.resource(edge.source).await? {
                let edge_size = edge.extra.len() as u64 + config.edge_overhead;
                quota::release(writer, source.pool, edge_size, now).await?;
            }
        }
        tracing::info!("deleted resource {} ({} bytes)", id, size);
        deleted.push(id);
        Ok(deleted)
    }
    .boxed()
}

/// Hard delete a tenant with all of its resources and capabilities
pub async fn delete_tenant<W: StoreWrite>(
    writer: &mut W,
    config: &EngineConfig,
    tenant: TenantId,
    in_progress: &mut BTreeSet<ResourceId>,
    now: DateTime<Utc>,
) -> Result<Vec<ResourceId>> {
    let mut deleted = Vec::new();
    for resource in writer.resources_of_tenant(tenant).await? {
        deleted.extend(delete_resource(writer, config, resource.id, in_progress, now).await?);
    }
    for capability in writer.capabilities_of_tenant(tenant).await? {
        writer.delete_capability(capability.id).await?;
    }
    writer.delete_tenant(tenant).await?;
    tracing::info!("deleted tenant {} with {} resources", tenant, deleted.len());
    Ok(deleted)
}
