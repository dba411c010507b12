//! Capability evaluation
//!
//! Turning an authorization set into an access decision happens in stages:
//!
//! 1. [`TokenResolver`] parses `tenant:key` entries and digests the keys
//! 2. candidate capabilities are fetched per tenant and opened with the key
//! 3. [`dispatch`] routes each decrypted [`Claim`] to its handler
//! 4. [`AccessAggregator`] folds the outcomes into an [`AccessResult`]
//!
//! The entry point is [`Engine::evaluate`](crate::Engine::evaluate); results
//! are memoized in the request's [`EvaluationContext`].

mod aggregate;
mod claim;
mod context;
mod dispatch;
mod evaluate;
mod handlers;
mod predicate;
mod token;

pub use aggregate::{AccessAggregator, AccessResult, TenantGrant};
pub use claim::{
    AuthClaim, Claim, ClaimError, CreateClaim, DeleteClaim, InjectClaim, InjectedReference,
    Injection, ManageClaim, ManageExclusions, PushClaim, ResourceFilter, StoredUpdateClaim,
    UpdateClaim, ViewClaim,
};
pub use context::{Compensation, EvaluationContext};
pub use dispatch::{
    dispatch, AccessLevel, DispatchInput, Exercise, Grant, HandlerOutcome, Limits, Scope,
    TargetKind,
};
pub use predicate::{FieldMatch, Predicate, Subject};
pub use token::{authorization_entry, tenant_global_id, ResolvedToken, TokenError, TokenResolver};
