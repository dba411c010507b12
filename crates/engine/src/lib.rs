/**
 * Capability evaluation.
 *  Turns an authorization set into a predicate
 *  and access level per tenant.
 */
pub mod access;
pub mod config;
/**
 * Sealing of capability claims and
 *  digests of the keys that open them.
 */
pub mod crypto;
mod engine;
pub mod error;
/**
 * Edge and tag validation, and cascading
 *  deletion over the reference graph.
 */
pub mod graph;
pub mod model;
/**
 * Byte accounting against pools.
 */
pub mod quota;
/**
 * Storage seam: provider traits and an
 *  in-memory implementation.
 */
pub mod store;
/**
 * Version-checked writes of tenants and
 *  resources, one transaction each.
 */
pub mod write;

pub use engine::Engine;

pub mod prelude {
    pub use crate::access::{
        authorization_entry, AccessLevel, AccessResult, Claim, EvaluationContext, Predicate,
        Scope, Subject, TargetKind,
    };
    pub use crate::config::EngineConfig;
    pub use crate::crypto::{CapabilityKey, DigestAlgorithm};
    pub use crate::error::{EngineError, Result};
    pub use crate::model::{
        Capability, CapabilityId, DeleteRecursive, Edge, EdgeSpec, Pool, PoolId, Resource,
        ResourceId, Tag, Tenant, TenantId, VersionToken,
    };
    pub use crate::store::{MemoryStore, StoreProvider, StoreRead, StoreWrite};
    pub use crate::write::{
        EdgesUpdate, NewCapability, NewResource, NewTenant, ResourceUpdate, TagsUpdate,
        TenantUpdate, WriteOutcome,
    };
    pub use crate::Engine;
}
