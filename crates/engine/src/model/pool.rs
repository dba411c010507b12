use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::PoolId;

/// The owner of stored bytes.
///
/// Every resource's footprint is charged against exactly one pool. A pool
/// without a `quota` is unbounded; `max_upload_size` caps the payload of any
/// single write landing in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    /// Byte quota, `None` means unlimited
    pub quota: Option<u64>,
    /// Bytes currently charged to this pool
    pub bytes_in_use: u64,
    /// Per-write payload cap
    pub max_upload_size: Option<u64>,
    pub last_used: Option<DateTime<Utc>>,
    /// Inactive pools accept no writes
    pub active: bool,
}

impl Pool {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            id: PoolId::generate(),
            quota,
            bytes_in_use: 0,
            max_upload_size: None,
            last_used: None,
            active: true,
        }
    }

    pub fn with_max_upload_size(mut self, max: u64) -> Self {
        self.max_upload_size = Some(max);
        self
    }

    /// Whether charging `delta` more bytes stays within the quota.
    pub fn admits(&self, delta: i64) -> bool {
        match self.quota {
            Some(quota) if delta > 0 => self
                .bytes_in_use
                .checked_add(delta as u64)
                .map(|total| total <= quota)
                .unwrap_or(false),
            _ => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_admits_within_quota() {
        let mut pool = Pool::new(Some(100));
        pool.bytes_in_use = 60;
        assert!(pool.admits(40));
        assert!(!pool.admits(41));
        assert!(pool.admits(-60));
    }

    #[test]
    fn test_unbounded_pool_admits_anything() {
        let pool = Pool::new(None);
        assert!(pool.admits(i64::MAX));
    }
}
