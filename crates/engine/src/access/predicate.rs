//! Predicate AST over resources and tenants
//!
//! Grants describe *which* records they speak for as a [`Predicate`]. The
//! constructors keep predicates in a canonical form (flattened, sorted and
//! deduplicated conjunctions/disjunctions with constants folded), so two
//! predicates built from the same parts in a different order compare equal.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::model::{CapabilityId, Resource, Tag, Tenant, TenantId};

static NO_TAGS: BTreeSet<Tag> = BTreeSet::new();
static NO_LINKS: BTreeSet<CapabilityId> = BTreeSet::new();

/// The view of a record a predicate is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub id: Uuid,
    pub tenant: TenantId,
    pub type_name: Option<&'a str>,
    pub state: &'a str,
    pub tags: &'a BTreeSet<Tag>,
    /// Capabilities joined to the record
    pub capability_links: &'a BTreeSet<CapabilityId>,
}

impl<'a> Subject<'a> {
    pub fn resource(resource: &'a Resource, links: &'a BTreeSet<CapabilityId>) -> Self {
        Self {
            id: resource.id.as_uuid(),
            tenant: resource.tenant,
            type_name: Some(&resource.type_name),
            state: &resource.state,
            tags: &resource.tags,
            capability_links: links,
        }
    }

    /// Tenants carry no tags or links; their state follows the public flag
    pub fn tenant(tenant: &'a Tenant) -> Self {
        Self {
            id: tenant.id.as_uuid(),
            tenant: tenant.id,
            type_name: None,
            state: if tenant.public { "public" } else { "protected" },
            tags: &NO_TAGS,
            capability_links: &NO_LINKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldMatch {
    /// Record belongs to the tenant
    Tenant(TenantId),
    /// Record id is one of
    Ids(BTreeSet<Uuid>),
    Types(BTreeSet<String>),
    States(BTreeSet<String>),
    /// Some tag starts with one of the prefixes
    TagPrefix(BTreeSet<String>),
    /// Record is joined to one of the capabilities
    LinkedTo(BTreeSet<CapabilityId>),
    /// Record is joined to no capability at all
    Unlinked,
}

impl FieldMatch {
    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        match self {
            FieldMatch::Tenant(tenant) => subject.tenant == *tenant,
            FieldMatch::Ids(ids) => ids.contains(&subject.id),
            FieldMatch::Types(types) => subject
                .type_name
                .map(|t| types.contains(t))
                .unwrap_or(false),
            FieldMatch::States(states) => states.contains(subject.state),
            FieldMatch::TagPrefix(prefixes) => subject
                .tags
                .iter()
                .any(|tag| prefixes.iter().any(|p| tag.matches_prefix(p))),
            FieldMatch::LinkedTo(capabilities) => !subject.capability_links.is_disjoint(capabilities),
            FieldMatch::Unlinked => subject.capability_links.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Match(FieldMatch),
}

impl Predicate {
    pub fn ids<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Uuid>,
    {
        Predicate::Match(FieldMatch::Ids(ids.into_iter().map(Into::into).collect()))
    }

    pub fn tenant(tenant: TenantId) -> Self {
        Predicate::Match(FieldMatch::Tenant(tenant))
    }

    /// Conjunction of `parts`, `True` when empty
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut flat = BTreeSet::new();
        for part in parts {
            match part {
                Predicate::True => {}
                Predicate::False => return Predicate::False,
                Predicate::And(inner) => flat.extend(inner),
                other => {
                    flat.insert(other);
                }
            }
        }
        match flat.len() {
            0 => Predicate::True,
            1 => flat.into_iter().next().unwrap_or(Predicate::True),
            _ => Predicate::And(flat.into_iter().collect()),
        }
    }

    /// Disjunction of `parts`, `False` when empty
    pub fn any(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut flat = BTreeSet::new();
        for part in parts {
            match part {
                Predicate::False => {}
                Predicate::True => return Predicate::True,
                Predicate::Or(inner) => flat.extend(inner),
                other => {
                    flat.insert(other);
                }
            }
        }
        match flat.len() {
            0 => Predicate::False,
            1 => flat.into_iter().next().unwrap_or(Predicate::False),
            _ => Predicate::Or(flat.into_iter().collect()),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Predicate::True => Predicate::False,
            Predicate::False => Predicate::True,
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::all([self, other])
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::any([self, other])
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Predicate::False)
    }

    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(subject)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(subject)),
            Predicate::Not(inner) => !inner.matches(subject),
            Predicate::Match(field) => field.matches(subject),
        }
    }
}
