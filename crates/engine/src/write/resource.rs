use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access::{AccessResult, EvaluationContext, Injection, Limits, Scope, Subject, TargetKind};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::graph::{cascade, check_required_keys, parse_tags, resolve_edges, resolve_injected};
use crate::model::{
    states, DeleteRecursive, EdgeSpec, PoolId, Resource, ResourceId, Tag, Tenant, TenantId,
    VersionToken, PUSH_GROUP,
};
use crate::quota;
use crate::store::{StoreProvider, StoreRead, StoreWrite};

use super::{NewCapability, WriteOutcome};

/// How an update changes the tag set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagsUpdate {
    Replace(Vec<String>),
    /// `remove` entries are exact tags or bare names, see
    ///  [`Tag::matches_removal`]
    Incremental { add: Vec<String>, remove: Vec<String> },
}

/// How an update changes the outgoing edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgesUpdate {
    Replace(Vec<EdgeSpec>),
    /// Drops every edge to the `remove` targets, then adds `add`
    Incremental {
        add: Vec<EdgeSpec>,
        remove: Vec<ResourceId>,
    },
}

#[derive(Debug, Clone)]
pub struct NewResource {
    pub tenant: TenantId,
    pub type_name: String,
    pub state: String,
    pub payload: Vec<u8>,
    pub content_hash: String,
    pub tags: Vec<String>,
    pub edges: Vec<EdgeSpec>,
    /// Defaults to the tenant's pool
    pub pool: Option<PoolId>,
    /// Create under a push grant on this resource instead of a create grant
    pub push_parent: Option<ResourceId>,
    /// Capabilities joined to the new resource
    pub capabilities: Vec<NewCapability>,
}

impl NewResource {
    pub fn new(
        tenant: TenantId,
        type_name: impl Into<String>,
        content_hash: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            tenant,
            type_name: type_name.into(),
            state: states::PROTECTED.to_string(),
            payload,
            content_hash: content_hash.into(),
            tags: Vec::new(),
            edges: Vec::new(),
            pool: None,
            push_parent: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn in_pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pushed_to(mut self, parent: ResourceId) -> Self {
        self.push_parent = Some(parent);
        self
    }

    pub fn with_capability(mut self, capability: NewCapability) -> Self {
        self.capabilities.push(capability);
        self
    }
}

/// Changes to a resource; `None` fields stay as they are
#[derive(Debug, Clone)]
pub struct ResourceUpdate {
    pub expected_version: VersionToken,
    pub payload: Option<Vec<u8>>,
    pub content_hash: Option<String>,
    pub state: Option<String>,
    pub tags: Option<TagsUpdate>,
    pub edges: Option<EdgesUpdate>,
    /// Move the resource's bytes into another pool
    pub pool: Option<PoolId>,
    /// Replaces every capability joined to the resource
    pub capabilities: Option<Vec<NewCapability>>,
}

impl ResourceUpdate {
    pub fn new(expected_version: VersionToken) -> Self {
        Self {
            expected_version,
            payload: None,
            content_hash: None,
            state: None,
            tags: None,
            edges: None,
            pool: None,
            capabilities: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>, content_hash: impl Into<String>) -> Self {
        self.payload = Some(payload);
        self.content_hash = Some(content_hash.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_tags(mut self, tags: TagsUpdate) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_edges(mut self, edges: EdgesUpdate) -> Self {
        self.edges = Some(edges);
        self
    }

    pub fn with_pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<NewCapability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Whether anything besides tags and edges changes
    fn touches_content(&self) -> bool {
        self.payload.is_some()
            || self.content_hash.is_some()
            || self.state.is_some()
            || self.pool.is_some()
            || self.capabilities.is_some()
    }
}

/// What a sweep hard deleted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resources: Vec<ResourceId>,
    pub tenants: Vec<TenantId>,
}

fn apply_tags(current: &BTreeSet<Tag>, update: &TagsUpdate) -> Result<BTreeSet<Tag>> {
    match update {
        TagsUpdate::Replace(tags) => parse_tags(tags),
        TagsUpdate::Incremental { add, remove } => {
            let mut tags: BTreeSet<Tag> = current
                .iter()
                .filter(|tag| !remove.iter().any(|entry| tag.matches_removal(entry)))
                .cloned()
                .collect();
            tags.extend(parse_tags(add)?);
            Ok(tags)
        }
    }
}

fn check_allowed_tags(limits: &Limits, old: &BTreeSet<Tag>, new: &BTreeSet<Tag>) -> Result<()> {
    match old
        .symmetric_difference(new)
        .find(|tag| !limits.tag_allowed(tag.as_str()))
    {
        Some(tag) => Err(EngineError::PermissionDenied(format!(
            "tag {} may not be changed",
            tag.as_str()
        ))),
        None => Ok(()),
    }
}

/// Add injected tags and references to a write
async fn apply_injection<R: StoreRead>(
    reader: &mut R,
    resource: &mut Resource,
    specs: &mut Vec<EdgeSpec>,
    injection: &Injection,
) -> Result<()> {
    for raw in &injection.injected_tags {
        resource.tags.insert(Tag::parse(raw)?);
    }
    for reference in &injection.injected_references {
        let spec = resolve_injected(reader, resource.tenant, reference).await?;
        specs.retain(|s| !(s.target == spec.target && s.group == spec.group));
        specs.push(spec);
    }
    Ok(())
}

/// A resource may only be stored in its tenant's pool, or in the pool of a
///  tenant whose create grant covers that tenant
async fn ensure_pool_reachable<R: StoreRead>(
    reader: &mut R,
    own: &Tenant,
    pool: PoolId,
    grants: Option<&AccessResult>,
) -> Result<()> {
    if pool == own.pool {
        return Ok(());
    }
    if let Some(access) = grants {
        for (tenant, _) in access.tenants() {
            let Some(tenant) = reader.tenant(*tenant).await? else {
                continue;
            };
            if tenant.pool == pool && access.permits(&Subject::tenant(&tenant)) {
                return Ok(());
            }
        }
    }
    Err(EngineError::PermissionDenied(format!(
        "pool {} is not reachable",
        pool
    )))
}

fn grant_limits(access: &AccessResult, tenant: TenantId) -> Limits {
    access
        .tenant(tenant)
        .map(|grant| grant.limits.clone())
        .unwrap_or_default()
}

fn grant_injection(access: &AccessResult, tenant: TenantId) -> Injection {
    access.injection(tenant).cloned().unwrap_or_default()
}

impl<S: StoreProvider> Engine<S> {
    pub async fn create_resource(
        &self,
        ctx: &mut EvaluationContext,
        new: NewResource,
    ) -> Result<Resource> {
        let access = match new.push_parent {
            Some(parent) => {
                let queried: BTreeSet<Uuid> = [parent.as_uuid()].into();
                self.evaluate(ctx, Scope::Push, TargetKind::Resource, Some(&queried))
                    .await?
            }
            None => {
                self.evaluate(ctx, Scope::Create, TargetKind::Resource, None)
                    .await?
            }
        };
        let pool_access = match new.pool {
            Some(_) => Some(
                self.evaluate(ctx, Scope::Create, TargetKind::Tenant, None)
                    .await?,
            ),
            None => None,
        };

        let now = Utc::now();
        let mut writer = self.store().writer().await?;
        let tenant = writer
            .tenant(new.tenant)
            .await?
            .filter(|tenant| tenant.destroy_at.is_none())
            .ok_or_else(|| EngineError::NotFound(format!("tenant {}", new.tenant)))?;
        let mut resource = Resource {
            id: ResourceId::generate(),
            tenant: tenant.id,
            pool: new.pool.unwrap_or(tenant.pool),
            type_name: new.type_name,
            state: new.state,
            payload: new.payload,
            content_hash: new.content_hash,
            tags: parse_tags(&new.tags)?,
            version: VersionToken::fresh(),
            destroy_at: None,
        };

        let mut specs = new.edges;
        match new.push_parent {
            Some(parent_id) => {
                let parent = writer
                    .resource(parent_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("resource {}", parent_id)))?;
                let links = writer.capability_links(parent_id).await?;
                if parent.tenant != tenant.id || !access.permits(&Subject::resource(&parent, &links))
                {
                    return Err(EngineError::PermissionDenied(format!(
                        "no push access to resource {}",
                        parent_id
                    )));
                }
                specs.retain(|spec| spec.target != parent_id || spec.group != PUSH_GROUP);
                specs.push(EdgeSpec::new(parent_id, PUSH_GROUP).with_policy(DeleteRecursive::Always));
            }
            None => {
                if !access.permits(&Subject::resource(&resource, &BTreeSet::new())) {
                    return Err(EngineError::PermissionDenied(format!(
                        "no create access in tenant {}",
                        tenant.id
                    )));
                }
            }
        }

        let limits = grant_limits(&access, tenant.id);
        check_allowed_tags(&limits, &BTreeSet::new(), &resource.tags)?;
        let injection = grant_injection(&access, tenant.id);
        apply_injection(&mut writer, &mut resource, &mut specs, &injection).await?;
        ensure_pool_reachable(&mut writer, &tenant, resource.pool, pool_access.as_deref()).await?;

        if writer
            .resource_by_hash(tenant.id, &resource.content_hash)
            .await?
            .is_some()
        {
            return Err(EngineError::InvariantViolation(format!(
                "content hash {} already exists in tenant {}",
                resource.content_hash, tenant.id
            )));
        }
        let edges = resolve_edges(&mut writer, self.config(), resource.id, &specs).await?;
        check_required_keys(&mut writer, &resource, &edges, &injection.required_keys).await?;

        let pool = writer
            .pool(resource.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", resource.pool)))?;
        quota::check_upload(&pool, &limits, resource.payload.len())?;
        let size = quota::footprint(&resource, &edges, self.config().edge_overhead);
        quota::charge(&mut writer, resource.pool, size as i64, now).await?;

        writer.put_resource(&resource).await?;
        writer.replace_edges(resource.id, &edges).await?;
        for capability in &new.capabilities {
            let sealed = capability.seal(self.config(), tenant.id, Some(resource.id), now)?;
            writer.put_capability(&sealed).await?;
        }
        writer.commit().await?;
        ctx.invalidate();
        tracing::debug!(
            "created resource {} in tenant {} ({} bytes)",
            resource.id,
            tenant.id,
            size
        );
        Ok(resource)
    }

    pub async fn update_resource(
        &self,
        ctx: &mut EvaluationContext,
        id: ResourceId,
        update: ResourceUpdate,
    ) -> Result<WriteOutcome<Resource>> {
        let queried: BTreeSet<Uuid> = [id.as_uuid()].into();
        let access = self
            .evaluate(ctx, Scope::Update, TargetKind::Resource, Some(&queried))
            .await?;
        let pool_access = match update.pool {
            Some(_) => Some(
                self.evaluate(ctx, Scope::Create, TargetKind::Tenant, None)
                    .await?,
            ),
            None => None,
        };

        let now = Utc::now();
        let mut writer = self.store().writer().await?;
        let current = writer
            .resource(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", id)))?;
        let links = writer.capability_links(id).await?;
        if !access.permits(&Subject::resource(&current, &links)) {
            return Err(EngineError::PermissionDenied(format!(
                "no update access to resource {}",
                id
            )));
        }
        if current.version != update.expected_version {
            return Ok(WriteOutcome::stale(current));
        }
        if current.is_locked() {
            return Err(EngineError::Locked(id));
        }

        let limits = grant_limits(&access, current.tenant);
        if limits.restricted && update.touches_content() {
            return Err(EngineError::PermissionDenied(
                "restricted grants may only change tags and references".to_string(),
            ));
        }

        let mut next = current.clone();
        if let Some(payload) = update.payload {
            next.payload = payload;
        }
        if let Some(hash) = update.content_hash {
            next.content_hash = hash;
        }
        if let Some(state) = update.state {
            next.state = state;
        }
        if let Some(tags) = &update.tags {
            next.tags = apply_tags(&current.tags, tags)?;
            check_allowed_tags(&limits, &current.tags, &next.tags)?;
        }

        let old_edges = writer.edges_from(id).await?;
        let as_spec = |edge: &crate::model::Edge| EdgeSpec {
            target: edge.target,
            group: edge.group.clone(),
            extra: edge.extra.clone(),
            delete_recursive: Some(edge.delete_recursive),
        };
        let mut specs: Vec<EdgeSpec> = match update.edges {
            None => old_edges.iter().map(as_spec).collect(),
            Some(EdgesUpdate::Replace(specs)) => specs,
            Some(EdgesUpdate::Incremental { add, remove }) => {
                let mut specs: Vec<EdgeSpec> = old_edges
                    .iter()
                    .filter(|edge| !remove.contains(&edge.target))
                    .map(as_spec)
                    .collect();
                for spec in add {
                    specs.retain(|s| !(s.target == spec.target && s.group == spec.group));
                    specs.push(spec);
                }
                specs
            }
        };

        let injection = grant_injection(&access, current.tenant);
        apply_injection(&mut writer, &mut next, &mut specs, &injection).await?;

        if let Some(pool) = update.pool {
            next.pool = pool;
            let tenant = writer
                .tenant(current.tenant)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("tenant {}", current.tenant)))?;
            ensure_pool_reachable(&mut writer, &tenant, pool, pool_access.as_deref()).await?;
        }
        if next.content_hash != current.content_hash {
            if let Some(other) = writer
                .resource_by_hash(next.tenant, &next.content_hash)
                .await?
            {
                if other.id != id {
                    return Err(EngineError::InvariantViolation(format!(
                        "content hash {} already exists in tenant {}",
                        next.content_hash, next.tenant
                    )));
                }
            }
        }

        let edges = resolve_edges(&mut writer, self.config(), id, &specs).await?;
        check_required_keys(&mut writer, &next, &edges, &injection.required_keys).await?;

        if next.payload != current.payload || next.pool != current.pool {
            let pool = writer
                .pool(next.pool)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("pool {}", next.pool)))?;
            quota::check_upload(&pool, &limits, next.payload.len())?;
        }
        let overhead = self.config().edge_overhead;
        let old_size = quota::footprint(&current, &old_edges, overhead);
        let new_size = quota::footprint(&next, &edges, overhead);
        if next.pool == current.pool {
            quota::charge(
                &mut writer,
                next.pool,
                new_size as i64 - old_size as i64,
                now,
            )
            .await?;
        } else {
            quota::transfer(&mut writer, current.pool, next.pool, old_size, new_size, now).await?;
        }

        next.version = VersionToken::fresh();
        writer.put_resource(&next).await?;
        writer.replace_edges(id, &edges).await?;
        if let Some(capabilities) = update.capabilities {
            for old in writer.capabilities_of_tenant(next.tenant).await? {
                if old.resource == Some(id) {
                    writer.delete_capability(old.id).await?;
                }
            }
            for capability in &capabilities {
                let sealed = capability.seal(self.config(), next.tenant, Some(id), now)?;
                writer.put_capability(&sealed).await?;
            }
        }
        writer.commit().await?;
        ctx.invalidate();
        Ok(WriteOutcome::written(next))
    }

    /// Mark a resource for destruction after the grace window
    pub async fn delete_resource(
        &self,
        ctx: &mut EvaluationContext,
        id: ResourceId,
    ) -> Result<Resource> {
        let deadline = self.config().destruction_deadline(Utc::now());
        let resource = self.mark_destruction(ctx, id, Some(deadline)).await?;
        tracing::info!("resource {} marked for destruction at {}", id, deadline);
        Ok(resource)
    }

    /// Take back a pending destruction mark
    pub async fn reset_deletion(
        &self,
        ctx: &mut EvaluationContext,
        id: ResourceId,
    ) -> Result<Resource> {
        self.mark_destruction(ctx, id, None).await
    }

    async fn mark_destruction(
        &self,
        ctx: &mut EvaluationContext,
        id: ResourceId,
        destroy_at: Option<DateTime<Utc>>,
    ) -> Result<Resource> {
        let queried: BTreeSet<Uuid> = [id.as_uuid()].into();
        let access = self
            .evaluate(ctx, Scope::Delete, TargetKind::Resource, Some(&queried))
            .await?;

        let mut writer = self.store().writer().await?;
        let mut resource = writer
            .resource(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", id)))?;
        let links = writer.capability_links(id).await?;
        if !access.permits(&Subject::resource(&resource, &links)) {
            return Err(EngineError::PermissionDenied(format!(
                "no delete access to resource {}",
                id
            )));
        }
        resource.destroy_at = destroy_at;
        resource.version = VersionToken::fresh();
        writer.put_resource(&resource).await?;
        writer.commit().await?;
        ctx.invalidate();
        Ok(resource)
    }

    /// Hard delete every resource and tenant whose destruction mark is due
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut writer = self.store().writer().await?;
        let mut in_progress = BTreeSet::new();
        let mut report = SweepReport::default();
        for id in writer.resources_due(now).await? {
            report.resources.extend(
                cascade::delete_resource(&mut writer, self.config(), id, &mut in_progress, now)
                    .await?,
            );
        }
        for tenant in writer.tenants_due(now).await? {
            report.resources.extend(
                cascade::delete_tenant(&mut writer, self.config(), tenant, &mut in_progress, now)
                    .await?,
            );
            report.tenants.push(tenant);
        }
        writer.commit().await?;
        tracing::info!(
            "sweep removed {} resources and {} tenants",
            report.resources.len(),
            report.tenants.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(raw: &[&str]) -> BTreeSet<Tag> {
        parse_tags(raw).unwrap()
    }

    #[test]
    fn test_incremental_tags() {
        let current = tags(&["name=a", "name=b", "state=open", "flag"]);
        let next = apply_tags(
            &current,
            &TagsUpdate::Incremental {
                add: vec!["state=done".to_string()],
                remove: vec!["name".to_string(), "state=open".to_string()],
            },
        )
        .unwrap();
        assert_eq!(next, tags(&["flag", "state=done"]));

        let replaced = apply_tags(&current, &TagsUpdate::Replace(vec!["x".to_string()])).unwrap();
        assert_eq!(replaced, tags(&["x"]));
    }

    #[test]
    fn test_allowed_tags_cover_both_directions() {
        let limits = Limits {
            allowed_tags: Some(["state=".to_string()].into()),
            ..Default::default()
        };
        let old = tags(&["name=a", "state=open"]);
        assert!(check_allowed_tags(&limits, &old, &tags(&["name=a", "state=done"])).is_ok());
        assert!(check_allowed_tags(&limits, &old, &tags(&["state=open"])).is_err());
        assert!(check_allowed_tags(&limits, &old, &tags(&["name=a", "state=open", "x"])).is_err());
    }
}
