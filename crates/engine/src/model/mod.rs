//! Persisted entities the engine reasons about
//!
//! - **[`Pool`]**: quota owner, charged for every stored byte
//! - **[`Tenant`]**: namespace owning resources and capabilities
//! - **[`Resource`]**: content-addressed, tagged, encrypted item
//! - **[`Capability`]**: encrypted, time-bounded permission
//! - **[`Edge`]**: labeled reference between two resources
//! - **[`Tag`]**: flag or `name=value` attached to a resource

mod capability;
mod edge;
mod ids;
mod pool;
mod resource;
mod tag;
mod tenant;

pub use capability::Capability;
pub use edge::{DeleteRecursive, Edge, EdgeSpec, KEY_GROUP, PUSH_GROUP, TRANSFER_GROUP};
pub use ids::{CapabilityId, PoolId, ResourceId, TenantId, VersionToken};
pub use pool::Pool;
pub use resource::{states, Resource};
pub use tag::{Tag, TagError, FROZEN_TAG, IMMUTABLE_TAG};
pub use tenant::Tenant;
