//! One handler per claim kind
//!
//! | kind          | scopes                                   | level        |
//! |---------------|------------------------------------------|--------------|
//! | view          | view                                     | Normal       |
//! | delete        | delete / view                            | Elevated / Normal |
//! | update        | update / view (tenants: update, view)    | Elevated / Normal |
//! | create        | create / view (tenants)                  | Elevated / Normal |
//! | push          | push / view                              | Elevated / Peek   |
//! | manage        | all                                      | Owner        |
//! | auth          | auth / view                              | Peek         |
//! | inject        | create, update, push                     | none         |
//! | storedUpdate  | update / view                            | Elevated / Normal |
//!
//! A grant that is already outranked by the tenant's accumulated level is
//! reported as not applicable, except for the injection it carries, which
//! always reaches the aggregator.

use std::collections::BTreeSet;

use super::claim::{
    AuthClaim, CreateClaim, DeleteClaim, InjectClaim, Injection, ManageClaim, PushClaim,
    StoredUpdateClaim, UpdateClaim, ViewClaim,
};
use super::dispatch::{
    AccessLevel, DispatchInput, Exercise, Grant, HandlerOutcome, Limits, Scope, TargetKind,
};
use super::predicate::Predicate;

fn limits(allowed_tags: &Option<Vec<String>>, max_upload_size: Option<u64>, restricted: bool) -> Limits {
    Limits {
        allowed_tags: allowed_tags
            .as_ref()
            .map(|tags| tags.iter().cloned().collect()),
        max_upload_size,
        restricted,
    }
}

fn grant(input: &DispatchInput<'_>, level: AccessLevel, predicate: Predicate) -> HandlerOutcome {
    grant_with(input, level, predicate, Limits::default(), Injection::default())
}

fn grant_with(
    input: &DispatchInput<'_>,
    level: AccessLevel,
    predicate: Predicate,
    limits: Limits,
    injection: Injection,
) -> HandlerOutcome {
    if input.outranked(level) {
        if injection.is_empty() {
            return HandlerOutcome::NotApplicable;
        }
        return HandlerOutcome::Inject(injection);
    }
    HandlerOutcome::Grant(
        Grant::new(level, input.bind(predicate))
            .with_limits(limits)
            .with_injection(injection),
    )
}

pub(crate) fn view(claim: &ViewClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match (input.scope, input.target) {
        (Scope::View, TargetKind::Resource) => {
            let outcome = grant(
                input,
                AccessLevel::Normal,
                claim.filter.predicate(input.hidden_states),
            );
            let exercise = Exercise {
                consume: claim.fetch,
                freeze: claim.freeze,
            };
            match outcome {
                HandlerOutcome::Grant(grant) => {
                    HandlerOutcome::Grant(grant.with_exercise(exercise))
                }
                other => other,
            }
        }
        (Scope::View, TargetKind::Tenant) => grant(input, AccessLevel::Normal, Predicate::True),
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn delete(claim: &DeleteClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match (input.scope, input.target) {
        (Scope::Delete, TargetKind::Resource) => {
            grant(input, AccessLevel::Elevated, claim.filter.predicate(&[]))
        }
        (Scope::View, TargetKind::Resource) => {
            grant(input, AccessLevel::Normal, claim.filter.predicate(&[]))
        }
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn update(claim: &UpdateClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match (input.scope, input.target) {
        (Scope::Update, TargetKind::Resource) => grant_with(
            input,
            AccessLevel::Elevated,
            claim.filter.predicate(&[]),
            limits(&claim.allowed_tags, claim.max_upload_size, claim.restricted),
            claim.injection.clone(),
        ),
        (Scope::View, TargetKind::Resource) => {
            grant(input, AccessLevel::Normal, claim.filter.predicate(&[]))
        }
        (Scope::Update, TargetKind::Tenant) => grant(input, AccessLevel::Elevated, Predicate::True),
        (Scope::View, TargetKind::Tenant) => grant(input, AccessLevel::Normal, Predicate::True),
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn create(claim: &CreateClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    let limits = limits(&claim.allowed_tags, claim.max_upload_size, false);
    match (input.scope, input.target) {
        (Scope::Create, TargetKind::Tenant) => grant_with(
            input,
            AccessLevel::Elevated,
            Predicate::True,
            limits,
            claim.injection.clone(),
        ),
        // the predicate is applied to the resource about to be created
        (Scope::Create, TargetKind::Resource) => grant_with(
            input,
            AccessLevel::Elevated,
            claim.filter.predicate(&[]),
            limits,
            claim.injection.clone(),
        ),
        (Scope::View, TargetKind::Tenant) => grant(input, AccessLevel::Normal, Predicate::True),
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn push(claim: &PushClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match (input.scope, input.target) {
        (Scope::Push, TargetKind::Resource) => grant_with(
            input,
            AccessLevel::Elevated,
            claim.filter.predicate(&[]),
            limits(&claim.allowed_tags, claim.max_upload_size, false),
            claim.injection.clone(),
        ),
        (Scope::View, TargetKind::Resource) => {
            grant(input, AccessLevel::Peek, claim.filter.predicate(&[]))
        }
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn manage(claim: &ManageClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    let excluded: BTreeSet<_> = match input.target {
        TargetKind::Tenant => claim.exclude.tenants.iter().map(|t| t.as_uuid()).collect(),
        TargetKind::Resource => claim
            .exclude
            .resources
            .iter()
            .map(|r| r.as_uuid())
            .collect(),
    };
    if let Some(queried) = input.queried {
        if !queried.is_disjoint(&excluded) {
            return HandlerOutcome::Reject;
        }
    }

    let mut parts = Vec::new();
    if !excluded.is_empty() {
        parts.push(Predicate::ids(excluded).negate());
    }
    if input.target == TargetKind::Resource {
        parts.extend(
            claim
                .exclude
                .tenants
                .iter()
                .map(|tenant| Predicate::tenant(*tenant).negate()),
        );
    }
    grant(input, AccessLevel::Owner, Predicate::all(parts))
}

pub(crate) fn auth(_claim: &AuthClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match input.scope {
        Scope::Auth | Scope::View => grant(input, AccessLevel::Peek, Predicate::True),
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn inject(claim: &InjectClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    match (input.scope, input.target) {
        (Scope::Create | Scope::Update | Scope::Push, TargetKind::Resource)
            if !claim.injection.is_empty() =>
        {
            HandlerOutcome::Inject(claim.injection.clone())
        }
        _ => HandlerOutcome::NotApplicable,
    }
}

pub(crate) fn stored_update(claim: &StoredUpdateClaim, input: &DispatchInput<'_>) -> HandlerOutcome {
    let targets = if !claim.resources.is_empty() {
        Predicate::ids(claim.resources.iter().copied())
    } else if input.bound_resource.is_some() {
        Predicate::True
    } else {
        // neither listed nor joined: speaks for nothing
        Predicate::False
    };
    match (input.scope, input.target) {
        (Scope::Update, TargetKind::Resource) => grant_with(
            input,
            AccessLevel::Elevated,
            targets,
            limits(&Some(claim.tags.clone()), None, true),
            Injection::default(),
        ),
        (Scope::View, TargetKind::Resource) => grant(input, AccessLevel::Normal, targets),
        _ => HandlerOutcome::NotApplicable,
    }
}
