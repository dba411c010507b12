use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{Capability, CapabilityId, ResourceId, TenantId};
use crate::store::{CapabilityBinding, CapabilityQuery, StoreProvider, StoreRead, StoreWrite};

use super::aggregate::{AccessAggregator, AccessResult};
use super::claim::Claim;
use super::context::EvaluationContext;
use super::dispatch::{dispatch, DispatchInput, Scope, TargetKind};
use super::token::{ResolvedToken, TokenResolver};

/// A capability whose claim could be read with a presented key
#[derive(Debug)]
struct Candidate {
    capability: Capability,
    claim: Claim,
    /// Digest of the newest algorithm, set when the stored one is older
    stale_digest: Option<String>,
}

impl<S: StoreProvider> Engine<S> {
    /// Evaluate the context's authorization set for `scope` on `target` records
    ///
    /// `queried` names the records the request is about, if any. Results are
    /// memoized in `ctx` until the next write.
    pub async fn evaluate(
        &self,
        ctx: &mut EvaluationContext,
        scope: Scope,
        target: TargetKind,
        queried: Option<&BTreeSet<Uuid>>,
    ) -> Result<Arc<AccessResult>> {
        if let Some(result) = ctx.cached(scope, target, queried) {
            return Ok(result);
        }

        let tokens = TokenResolver::new(&self.config().digest_algorithms).resolve(ctx.authorization());
        let mut by_tenant: BTreeMap<TenantId, Vec<ResolvedToken>> = BTreeMap::new();
        for token in tokens {
            by_tenant.entry(token.tenant).or_default().push(token);
        }

        let queried_resources: Option<Vec<ResourceId>> =
            queried.map(|ids| ids.iter().copied().map(ResourceId::from).collect());
        let binding = match target {
            TargetKind::Tenant => CapabilityBinding::TenantWide,
            TargetKind::Resource => CapabilityBinding::Resources(queried_resources.as_deref()),
        };
        let now = ctx.now();

        let lookups = by_tenant
            .iter()
            .map(|(tenant, tokens)| self.candidates(*tenant, tokens, binding, now));
        let per_tenant = join_all(lookups).await;

        let mut aggregator = AccessAggregator::new(scope, target, &self.config().public_states);
        for (tenant, candidates) in by_tenant.keys().zip(per_tenant) {
            for candidate in candidates? {
                if let Some(digest) = candidate.stale_digest {
                    self.rewrite_digest(ctx, candidate.capability.id, digest);
                }
                let input = DispatchInput {
                    scope,
                    target,
                    accumulated: aggregator.accumulated(*tenant),
                    bound_resource: candidate.capability.resource,
                    queried,
                    hidden_states: &self.config().hidden_states,
                };
                let outcome = dispatch(&candidate.claim, &input);
                aggregator.offer(*tenant, candidate.capability.id, outcome);
            }
        }

        let result = Arc::new(aggregator.finish());
        ctx.remember(scope, target, queried, result.clone());
        Ok(result)
    }

    /// Capabilities of one tenant that open with one of the presented keys
    async fn candidates(
        &self,
        tenant: TenantId,
        tokens: &[ResolvedToken],
        binding: CapabilityBinding<'_>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Candidate>> {
        let mut reader = self.store().reader().await?;
        let mut seen = BTreeSet::<CapabilityId>::new();
        let mut found = Vec::new();
        for token in tokens {
            let query = CapabilityQuery {
                tenant,
                digests: &token.digests,
                now,
                binding,
            };
            for capability in reader.capabilities(query).await? {
                if seen.contains(&capability.id) {
                    continue;
                }
                let opened = token.key.open(
                    &capability.nonce,
                    &capability.ciphertext,
                    capability.tenant.as_uuid().as_bytes(),
                );
                let claim = match opened.map_err(|e| e.to_string()).and_then(|raw| {
                    Claim::from_slice(&raw).map_err(|e| e.to_string())
                }) {
                    Ok(claim) => claim,
                    Err(err) => {
                        tracing::debug!("capability {} does not apply: {}", capability.id, err);
                        continue;
                    }
                };
                seen.insert(capability.id);
                let newest = token.digests.first().cloned();
                let stale_digest = newest.filter(|digest| *digest != capability.key_digest);
                found.push(Candidate {
                    capability,
                    claim,
                    stale_digest,
                });
            }
        }
        Ok(found)
    }

    /// Replace an outdated key digest in the background
    fn rewrite_digest(&self, ctx: &mut EvaluationContext, id: CapabilityId, digest: String) {
        let store = self.store().clone();
        ctx.track(tokio::spawn(async move {
            let result: Result<()> = async {
                let mut writer = store.writer().await?;
                writer.set_capability_digest(id, &digest).await?;
                writer.commit().await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => tracing::debug!("rewrote digest of capability {}", id),
                Err(err) => tracing::warn!("failed to rewrite digest of capability {}: {}", id, err),
            }
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::token::authorization_entry;
    use crate::access::{AccessLevel, ViewClaim};
    use crate::config::EngineConfig;
    use crate::crypto::{CapabilityKey, DigestAlgorithm};
    use crate::model::{Pool, Tenant};
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    async fn seed(
        store: &MemoryStore,
        claim: &Claim,
        key: &CapabilityKey,
        digest_with: DigestAlgorithm,
    ) -> (Tenant, Capability) {
        let pool = Pool::new(None);
        let tenant = Tenant::new(pool.id);
        let (nonce, ciphertext) = key
            .seal(&claim.to_vec().unwrap(), tenant.id.as_uuid().as_bytes())
            .unwrap();
        let capability = Capability {
            id: CapabilityId::generate(),
            tenant: tenant.id,
            resource: None,
            key_digest: digest_with.digest(key.bytes()),
            nonce,
            ciphertext,
            start: Utc::now() - Duration::minutes(1),
            stop: None,
            used: None,
        };
        let mut writer = store.writer().await.unwrap();
        writer.insert_pool(&pool).await.unwrap();
        writer.put_tenant(&tenant).await.unwrap();
        writer.put_capability(&capability).await.unwrap();
        writer.commit().await.unwrap();
        (tenant, capability)
    }

    #[tokio::test]
    async fn test_wrong_key_does_not_apply() {
        let store = MemoryStore::new();
        let engine = Engine::new(store.clone(), EngineConfig::default());
        let key = CapabilityKey::generate();
        let claim = Claim::View(ViewClaim::default());
        let (tenant, _) = seed(&store, &claim, &key, DigestAlgorithm::Sha512).await;

        let mut ctx = engine.context([authorization_entry(tenant.id, &key)]);
        let result = engine
            .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
            .await
            .unwrap();
        assert_eq!(result.tenant(tenant.id).unwrap().level, AccessLevel::Normal);

        let mut ctx = engine.context([authorization_entry(tenant.id, &CapabilityKey::generate())]);
        let result = engine
            .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
            .await
            .unwrap();
        assert!(result.tenant(tenant.id).is_none());
        assert!(result.capabilities().is_empty());
    }

    #[tokio::test]
    async fn test_old_digest_is_rewritten() {
        let store = MemoryStore::new();
        let engine = Engine::new(store.clone(), EngineConfig::default());
        let key = CapabilityKey::generate();
        let claim = Claim::View(ViewClaim::default());
        let (tenant, capability) = seed(&store, &claim, &key, DigestAlgorithm::Sha256).await;

        let mut ctx = engine.context([authorization_entry(tenant.id, &key)]);
        let result = engine
            .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
            .await
            .unwrap();
        assert!(result.capabilities().contains(&capability.id));
        engine.finish(ctx).await;

        let mut reader = store.reader().await.unwrap();
        let stored = reader.capability(capability.id).await.unwrap().unwrap();
        assert_eq!(stored.key_digest, DigestAlgorithm::Sha512.digest(key.bytes()));
    }
}
