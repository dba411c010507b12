//! Routing of claims to their handlers
//!
//! [`dispatch`] is a total function over [`Claim`]: the compiler enforces
//! that every kind has a handler. Handlers are pure; everything they may look
//! at is in the [`DispatchInput`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ResourceId;

use super::claim::{Claim, Injection};
use super::handlers;
use super::predicate::Predicate;

/// The operation a request wants to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    View,
    Create,
    Update,
    Delete,
    Push,
    Manage,
    Auth,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::View => "view",
            Scope::Create => "create",
            Scope::Update => "update",
            Scope::Delete => "delete",
            Scope::Push => "push",
            Scope::Manage => "manage",
            Scope::Auth => "auth",
        };
        f.write_str(name)
    }
}

/// The static kind of the records being queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    Tenant,
    Resource,
}

/// Privilege tier of a grant; the highest tier of a tenant wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Anonymous or peeking access
    Peek = 0,
    Normal = 1,
    Elevated = 2,
    /// Owner, manage capabilities
    Owner = 3,
}

/// Constraints on writes performed under a grant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
    /// Tag prefixes a write may set, `None` allows any tag
    pub allowed_tags: Option<BTreeSet<String>>,
    pub max_upload_size: Option<u64>,
    /// Only tags and edges may change
    pub restricted: bool,
}

impl Limits {
    /// The constraints of both grants at once
    pub fn intersect(self, other: Limits) -> Limits {
        let allowed_tags = match (self.allowed_tags, other.allowed_tags) {
            (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        let max_upload_size = match (self.max_upload_size, other.max_upload_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Limits {
            allowed_tags,
            max_upload_size,
            restricted: self.restricted || other.restricted,
        }
    }

    pub fn tag_allowed(&self, tag: &str) -> bool {
        self.allowed_tags
            .as_ref()
            .map(|prefixes| prefixes.iter().any(|p| tag.starts_with(p.as_str())))
            .unwrap_or(true)
    }
}

/// Side effects of exercising a grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exercise {
    /// Mark the capability used, it stops matching afterwards
    pub consume: bool,
    /// Lock the resources the grant was exercised on
    pub freeze: bool,
}

impl Exercise {
    pub fn is_noop(&self) -> bool {
        !self.consume && !self.freeze
    }
}

/// A handler's positive result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub level: AccessLevel,
    pub predicate: Predicate,
    pub limits: Limits,
    pub injection: Injection,
    pub exercise: Exercise,
}

impl Grant {
    pub fn new(level: AccessLevel, predicate: Predicate) -> Self {
        Self {
            level,
            predicate,
            limits: Limits::default(),
            injection: Injection::default(),
            exercise: Exercise::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_injection(mut self, injection: Injection) -> Self {
        self.injection = injection;
        self
    }

    pub fn with_exercise(mut self, exercise: Exercise) -> Self {
        self.exercise = exercise;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The claim does not speak to this scope and target kind
    NotApplicable,
    /// The claim forbids the query outright
    Reject,
    Grant(Grant),
    /// The claim grants nothing, but writes must carry its injection
    Inject(Injection),
}

/// Everything a handler may base its decision on
#[derive(Debug, Clone, Copy)]
pub struct DispatchInput<'a> {
    pub scope: Scope,
    pub target: TargetKind,
    /// Best level granted so far by other capabilities of the same tenant
    pub accumulated: Option<AccessLevel>,
    /// The resource the capability is joined to, if any
    pub bound_resource: Option<ResourceId>,
    /// Ids the query is about, if it is about specific records
    pub queried: Option<&'a BTreeSet<Uuid>>,
    /// States view claims hide unless they name them
    pub hidden_states: &'a [String],
}

impl DispatchInput<'_> {
    /// Narrow a predicate to the joined resource, if the capability has one
    pub(crate) fn bind(&self, predicate: Predicate) -> Predicate {
        match self.bound_resource {
            Some(resource) => predicate.and(Predicate::ids([resource])),
            None => predicate,
        }
    }

    /// Whether a grant at `level` could still matter
    pub(crate) fn outranked(&self, level: AccessLevel) -> bool {
        self.accumulated.map(|best| level < best).unwrap_or(false)
    }
}

/// Route a claim to its handler
pub fn dispatch(claim: &Claim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match claim {
        Claim::View(claim) => handlers::view(claim, input),
        Claim::Delete(claim) => handlers::delete(claim, input),
        Claim::Update(claim) => handlers::update(claim, input),
        Claim::Create(claim) => handlers::create(claim, input),
        Claim::Push(claim) => handlers::push(claim, input),
        Claim::Manage(claim) => handlers::manage(claim, input),
        Claim::Auth(claim) => handlers::auth(claim, input),
        Claim::Inject(claim) => handlers::inject(claim, input),
        Claim::StoredUpdate(claim) => handlers::stored_update(claim, input),
        Claim::Unknown => HandlerOutcome::NotApplicable,
    }
}
