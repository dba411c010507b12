use std::collections::BTreeSet;

use crate::access::InjectedReference;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{DeleteRecursive, Edge, EdgeSpec, Resource, ResourceId, Tag, TenantId, KEY_GROUP};
use crate::store::StoreRead;

/// The delete policy an edge of `group` ends up with
///
/// Forced groups only accept GROUP-EMPTY; elsewhere the default is ALWAYS.
pub fn edge_policy(
    config: &EngineConfig,
    group: &str,
    requested: Option<DeleteRecursive>,
) -> Result<DeleteRecursive> {
    let forced = config.is_forced_group_empty(group);
    match (forced, requested) {
        (true, None) | (true, Some(DeleteRecursive::GroupEmpty)) => Ok(DeleteRecursive::GroupEmpty),
        (true, Some(policy)) => Err(EngineError::InvariantViolation(format!(
            "edges in group {} must be GROUP-EMPTY, got {}",
            group, policy
        ))),
        (false, Some(policy)) => Ok(policy),
        (false, None) => Ok(DeleteRecursive::Always),
    }
}

/// Parse raw tags into a tag set
pub fn parse_tags<I, S>(raw: I) -> Result<BTreeSet<Tag>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|tag| Tag::parse(tag.as_ref()).map_err(EngineError::from))
        .collect()
}

/// Turn requested edges of `source` into stored edges
///
/// Rejects self edges, duplicate `(target, group)` pairs, unknown targets
/// and policies forbidden for the group.
pub async fn resolve_edges<R: StoreRead>(
    reader: &mut R,
    config: &EngineConfig,
    source: ResourceId,
    specs: &[EdgeSpec],
) -> Result<Vec<Edge>> {
    let mut seen = BTreeSet::new();
    let mut edges = Vec::with_capacity(specs.len());
    for spec in specs {
        if spec.target == source {
            return Err(EngineError::InvariantViolation(format!(
                "resource {} cannot reference itself",
                source
            )));
        }
        if spec.group.is_empty() {
            return Err(EngineError::InvariantViolation(
                "edge group is empty".to_string(),
            ));
        }
        if !seen.insert((spec.target, spec.group.as_str())) {
            return Err(EngineError::InvariantViolation(format!(
                "duplicate edge to {} in group {}",
                spec.target, spec.group
            )));
        }
        let delete_recursive = edge_policy(config, &spec.group, spec.delete_recursive)?;
        if reader.resource(spec.target).await?.is_none() {
            return Err(EngineError::InvariantViolation(format!(
                "edge target {} does not exist",
                spec.target
            )));
        }
        edges.push(Edge {
            source,
            target: spec.target,
            group: spec.group.clone(),
            extra: spec.extra.clone(),
            delete_recursive,
        });
    }
    Ok(edges)
}

/// Resolve an injected reference, whose target is an id or a content hash
///  within `tenant`
pub async fn resolve_injected<R: StoreRead>(
    reader: &mut R,
    tenant: TenantId,
    reference: &InjectedReference,
) -> Result<EdgeSpec> {
    let target = match reference.target.parse::<ResourceId>() {
        Ok(id) => Some(id),
        Err(_) => reader
            .resource_by_hash(tenant, &reference.target)
            .await?
            .map(|resource| resource.id),
    };
    let target = target.ok_or_else(|| {
        EngineError::InvariantViolation(format!(
            "injected reference target {} does not exist",
            reference.target
        ))
    })?;
    Ok(EdgeSpec {
        target,
        group: reference.group.clone(),
        extra: reference.extra.clone(),
        delete_recursive: reference.delete_recursive,
    })
}

/// Every required key must be the target of one of the resource's own
///  `key` edges, named by content hash or id
pub async fn check_required_keys<R: StoreRead>(
    reader: &mut R,
    resource: &Resource,
    edges: &[Edge],
    required: &[String],
) -> Result<()> {
    if required.is_empty() {
        return Ok(());
    }
    let mut provided = BTreeSet::new();
    for edge in edges.iter().filter(|edge| edge.group == KEY_GROUP) {
        provided.insert(edge.target.to_string());
        if let Some(target) = reader.resource(edge.target).await? {
            provided.insert(target.content_hash);
        }
    }
    match required.iter().find(|key| !provided.contains(key.as_str())) {
        Some(missing) => Err(EngineError::InvariantViolation(format!(
            "resource {} does not reference required key {}",
            resource.id, missing
        ))),
        None => Ok(()),
    }
}
