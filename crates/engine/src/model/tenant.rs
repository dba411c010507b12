use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PoolId, TenantId, VersionToken};

/// A namespace owning resources and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Globally unique human readable name, if registered
    pub name: Option<String>,
    /// Public tenants are visible to anonymous viewers
    pub public: bool,
    /// The tenant's primary pool
    pub pool: PoolId,
    pub version: VersionToken,
    /// Soft-delete mark, hard deleted by the sweep once passed
    pub destroy_at: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(pool: PoolId) -> Self {
        Self {
            id: TenantId::generate(),
            name: None,
            public: false,
            pool,
            version: VersionToken::fresh(),
            destroy_at: None,
        }
    }
}
