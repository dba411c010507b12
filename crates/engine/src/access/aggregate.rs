//! Combination of handler outcomes into one access decision
//!
//! Outcomes are folded per tenant: a higher level replaces the running
//! grant, an equal level intersects with it, a lower level is dropped.
//! Injection is unioned over every outcome of the tenant regardless of
//! level. A single [`HandlerOutcome::Reject`] empties the whole result.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{CapabilityId, TenantId};

use super::claim::{InjectedReference, Injection};
use super::dispatch::{AccessLevel, Exercise, Grant, HandlerOutcome, Limits, Scope, TargetKind};
use super::predicate::{FieldMatch, Predicate, Subject};

/// The winning grant of one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantGrant {
    pub level: AccessLevel,
    /// Not yet restricted to the tenant
    pub predicate: Predicate,
    pub limits: Limits,
    /// One-shot and freeze markers of capabilities at the winning level
    pub exercises: BTreeMap<CapabilityId, Exercise>,
}

impl TenantGrant {
    fn start(capability: CapabilityId, grant: Grant) -> Self {
        let mut exercises = BTreeMap::new();
        if !grant.exercise.is_noop() {
            exercises.insert(capability, grant.exercise);
        }
        Self {
            level: grant.level,
            predicate: grant.predicate,
            limits: grant.limits,
            exercises,
        }
    }

    fn merge(&mut self, capability: CapabilityId, grant: Grant) {
        self.predicate = std::mem::replace(&mut self.predicate, Predicate::True).and(grant.predicate);
        self.limits = std::mem::take(&mut self.limits).intersect(grant.limits);
        if !grant.exercise.is_noop() {
            self.exercises.insert(capability, grant.exercise);
        }
    }
}

#[derive(Debug, Default)]
struct TenantAccumulator {
    best: Option<TenantGrant>,
    tags: BTreeSet<String>,
    references: BTreeSet<InjectedReference>,
    required_keys: BTreeSet<String>,
}

impl TenantAccumulator {
    fn absorb(&mut self, injection: Injection) {
        self.tags.extend(injection.injected_tags);
        self.references.extend(injection.injected_references);
        self.required_keys.extend(injection.required_keys);
    }

    fn injection(&self) -> Injection {
        Injection {
            injected_tags: self.tags.iter().cloned().collect(),
            injected_references: self.references.iter().cloned().collect(),
            required_keys: self.required_keys.iter().cloned().collect(),
        }
    }
}

/// Running state of one evaluation
#[derive(Debug)]
pub struct AccessAggregator {
    scope: Scope,
    target: TargetKind,
    public_states: BTreeSet<String>,
    tenants: BTreeMap<TenantId, TenantAccumulator>,
    capabilities: BTreeSet<CapabilityId>,
    rejected: bool,
}

impl AccessAggregator {
    pub fn new(scope: Scope, target: TargetKind, public_states: &[String]) -> Self {
        Self {
            scope,
            target,
            public_states: public_states.iter().cloned().collect(),
            tenants: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            rejected: false,
        }
    }

    /// Best level granted to `tenant` so far
    pub fn accumulated(&self, tenant: TenantId) -> Option<AccessLevel> {
        self.tenants
            .get(&tenant)
            .and_then(|acc| acc.best.as_ref())
            .map(|best| best.level)
    }

    /// Fold in the outcome of one decrypted capability
    pub fn offer(&mut self, tenant: TenantId, capability: CapabilityId, outcome: HandlerOutcome) {
        self.capabilities.insert(capability);
        match outcome {
            HandlerOutcome::NotApplicable => {}
            HandlerOutcome::Reject => {
                tracing::debug!("capability {} rejects the query", capability);
                self.rejected = true;
            }
            HandlerOutcome::Inject(injection) => {
                self.tenants.entry(tenant).or_default().absorb(injection);
            }
            HandlerOutcome::Grant(mut grant) => {
                let acc = self.tenants.entry(tenant).or_default();
                acc.absorb(std::mem::take(&mut grant.injection));
                match acc.best.as_mut() {
                    Some(best) if grant.level < best.level => {}
                    Some(best) if grant.level == best.level => best.merge(capability, grant),
                    _ => acc.best = Some(TenantGrant::start(capability, grant)),
                }
            }
        }
    }

    pub fn finish(self) -> AccessResult {
        let mut clauses = Vec::new();
        let mut grants = BTreeMap::new();
        let mut injections = BTreeMap::new();
        for (tenant, acc) in self.tenants {
            let injection = acc.injection();
            if !injection.is_empty() {
                injections.insert(tenant, injection);
            }
            if let Some(best) = acc.best {
                clauses.push(Predicate::tenant(tenant).and(best.predicate.clone()));
                grants.insert(tenant, best);
            }
        }

        let baseline = match self.scope {
            Scope::View if !self.public_states.is_empty() => Some(Predicate::Match(
                FieldMatch::States(self.public_states.clone()),
            )),
            _ => None,
        };
        clauses.extend(baseline.clone());

        let linkage = Predicate::Match(FieldMatch::Unlinked).or(Predicate::Match(
            FieldMatch::LinkedTo(self.capabilities.clone()),
        ));
        let predicate = if self.rejected {
            Predicate::False
        } else {
            Predicate::any(clauses).and(linkage.clone())
        };

        AccessResult {
            scope: self.scope,
            target: self.target,
            predicate,
            grants,
            injections,
            baseline,
            linkage,
            capabilities: self.capabilities,
            rejected: self.rejected,
        }
    }
}

/// What an authorization set may do for one scope and target kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessResult {
    pub scope: Scope,
    pub target: TargetKind,
    /// Matches exactly the records the result speaks for
    pub predicate: Predicate,
    grants: BTreeMap<TenantId, TenantGrant>,
    injections: BTreeMap<TenantId, Injection>,
    baseline: Option<Predicate>,
    linkage: Predicate,
    capabilities: BTreeSet<CapabilityId>,
    rejected: bool,
}

impl AccessResult {
    pub fn permits(&self, subject: &Subject<'_>) -> bool {
        self.predicate.matches(subject)
    }

    /// The level the result grants on `subject`
    ///
    /// `None` is the "level 0, empty predicate" outcome: nothing, not even
    /// the public baseline, covers the subject. `Some(Peek)` means only the
    /// baseline or a peeking grant does.
    pub fn level_for(&self, subject: &Subject<'_>) -> Option<AccessLevel> {
        if self.rejected || !self.linkage.matches(subject) {
            return None;
        }
        let granted = self
            .grants
            .get(&subject.tenant)
            .filter(|grant| grant.predicate.matches(subject))
            .map(|grant| grant.level);
        let public = self
            .baseline
            .as_ref()
            .filter(|baseline| baseline.matches(subject))
            .map(|_| AccessLevel::Peek);
        granted.max(public)
    }

    pub fn tenant(&self, tenant: TenantId) -> Option<&TenantGrant> {
        if self.rejected {
            return None;
        }
        self.grants.get(&tenant)
    }

    pub fn tenants(&self) -> impl Iterator<Item = (&TenantId, &TenantGrant)> {
        self.grants.iter().filter(|_| !self.rejected)
    }

    /// Side data writes into `tenant` must carry
    pub fn injection(&self, tenant: TenantId) -> Option<&Injection> {
        self.injections.get(&tenant)
    }

    /// Every capability that was decrypted during the evaluation
    pub fn capabilities(&self) -> &BTreeSet<CapabilityId> {
        &self.capabilities
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// One-shot and freeze markers of the winning grants
    pub fn exercises(&self) -> impl Iterator<Item = (TenantId, CapabilityId, Exercise)> + '_ {
        self.tenants().flat_map(|(tenant, grant)| {
            grant
                .exercises
                .iter()
                .map(move |(capability, exercise)| (*tenant, *capability, *exercise))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{PoolId, Resource, ResourceId, Tag, VersionToken};

    fn types(names: &[&str]) -> Predicate {
        Predicate::Match(FieldMatch::Types(names.iter().map(|s| s.to_string()).collect()))
    }

    fn resource(tenant: TenantId, type_name: &str, state: &str) -> Resource {
        Resource {
            id: ResourceId::generate(),
            tenant,
            pool: PoolId::generate(),
            type_name: type_name.to_string(),
            state: state.to_string(),
            payload: Vec::new(),
            content_hash: ResourceId::generate().to_string(),
            tags: BTreeSet::<Tag>::new(),
            version: VersionToken::fresh(),
            destroy_at: None,
        }
    }

    fn aggregator() -> AccessAggregator {
        AccessAggregator::new(Scope::View, TargetKind::Resource, &["public".to_string()])
    }

    #[test]
    fn test_higher_level_replaces_lower() {
        let tenant = TenantId::generate();
        let mut agg = aggregator();
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Grant(Grant::new(AccessLevel::Normal, types(&["File"]))),
        );
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Grant(Grant::new(AccessLevel::Owner, Predicate::True)),
        );
        let result = agg.finish();
        let grant = result.tenant(tenant).unwrap();
        assert_eq!(grant.level, AccessLevel::Owner);
        assert_eq!(grant.predicate, Predicate::True);
    }

    #[test]
    fn test_equal_level_intersects() {
        let tenant = TenantId::generate();
        let both = [
            Grant::new(AccessLevel::Normal, types(&["File", "Text"])),
            Grant::new(AccessLevel::Normal, types(&["File"]).negate()),
        ];
        let mut forward = aggregator();
        let mut backward = aggregator();
        let ids = [CapabilityId::generate(), CapabilityId::generate()];
        for (id, grant) in ids.iter().zip(both.iter()) {
            forward.offer(tenant, *id, HandlerOutcome::Grant(grant.clone()));
        }
        for (id, grant) in ids.iter().zip(both.iter()).rev() {
            backward.offer(tenant, *id, HandlerOutcome::Grant(grant.clone()));
        }
        let forward = forward.finish();
        assert_eq!(forward, backward.finish());

        let text = resource(tenant, "Text", "protected");
        let file = resource(tenant, "File", "protected");
        let links = BTreeSet::new();
        assert!(forward.permits(&Subject::resource(&text, &links)));
        assert!(!forward.permits(&Subject::resource(&file, &links)));
    }

    #[test]
    fn test_reject_empties_everything() {
        let tenant = TenantId::generate();
        let mut agg = aggregator();
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Grant(Grant::new(AccessLevel::Owner, Predicate::True)),
        );
        agg.offer(tenant, CapabilityId::generate(), HandlerOutcome::Reject);
        let result = agg.finish();
        assert!(result.is_rejected());
        assert!(result.predicate.is_false());
        assert!(result.tenant(tenant).is_none());

        let public = resource(tenant, "File", "public");
        let links = BTreeSet::new();
        assert_eq!(result.level_for(&Subject::resource(&public, &links)), None);
    }

    #[test]
    fn test_public_baseline_and_linkage() {
        let tenant = TenantId::generate();
        let agg = aggregator();
        let result = agg.finish();

        let public = resource(tenant, "File", "public");
        let private = resource(tenant, "File", "protected");
        let unlinked = BTreeSet::new();
        assert_eq!(
            result.level_for(&Subject::resource(&public, &unlinked)),
            Some(AccessLevel::Peek)
        );
        assert!(!result.permits(&Subject::resource(&private, &unlinked)));

        // linked to a capability nobody presented
        let linked: BTreeSet<_> = [CapabilityId::generate()].into();
        assert!(!result.permits(&Subject::resource(&public, &linked)));
    }

    #[test]
    fn test_injection_unioned_across_levels() {
        let tenant = TenantId::generate();
        let mut agg = AccessAggregator::new(Scope::Update, TargetKind::Resource, &[]);
        let low = Grant::new(AccessLevel::Elevated, Predicate::True).with_injection(Injection {
            injected_tags: vec!["a".to_string()],
            ..Default::default()
        });
        agg.offer(tenant, CapabilityId::generate(), HandlerOutcome::Grant(low));
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Grant(Grant::new(AccessLevel::Owner, Predicate::True)),
        );
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Inject(Injection {
                injected_tags: vec!["b".to_string(), "a".to_string()],
                ..Default::default()
            }),
        );
        let result = agg.finish();
        assert_eq!(result.tenant(tenant).unwrap().level, AccessLevel::Owner);
        assert_eq!(
            result.injection(tenant).unwrap().injected_tags,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_exercises_follow_winning_level() {
        let tenant = TenantId::generate();
        let one_shot = CapabilityId::generate();
        let mut agg = aggregator();
        agg.offer(
            tenant,
            one_shot,
            HandlerOutcome::Grant(Grant::new(AccessLevel::Normal, Predicate::True).with_exercise(
                Exercise {
                    consume: true,
                    freeze: false,
                },
            )),
        );
        assert_eq!(agg.exercises_len(), 1);
        agg.offer(
            tenant,
            CapabilityId::generate(),
            HandlerOutcome::Grant(Grant::new(AccessLevel::Owner, Predicate::True)),
        );
        assert_eq!(agg.finish().exercises().count(), 0);
    }

    impl AccessAggregator {
        fn exercises_len(&self) -> usize {
            self.tenants
                .values()
                .filter_map(|acc| acc.best.as_ref())
                .map(|best| best.exercises.len())
                .sum()
        }
    }
}
