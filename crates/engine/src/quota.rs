//! Byte accounting against pools
//!
//! A resource's footprint is its payload, the text of its tags and, per
//! outgoing edge, the edge's extra data plus a fixed overhead. Every change
//! of a footprint is applied to the owning pool as a delta inside the write
//! transaction that caused it.

use chrono::{DateTime, Utc};

use crate::access::Limits;
use crate::error::{EngineError, Result};
use crate::model::{Edge, Pool, PoolId, Resource};
use crate::store::StoreWrite;

/// Bytes a resource and its outgoing edges occupy
pub fn footprint(resource: &Resource, edges: &[Edge], edge_overhead: u64) -> u64 {
    let tags: u64 = resource.tags.iter().map(|tag| tag.len() as u64).sum();
    let edges: u64 = edges
        .iter()
        .map(|edge| edge.extra.len() as u64 + edge_overhead)
        .sum();
    resource.payload.len() as u64 + tags + edges
}

async fn active_pool<W: StoreWrite>(writer: &mut W, id: PoolId) -> Result<Pool> {
    let pool = writer
        .pool(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("pool {}", id)))?;
    if !pool.active {
        return Err(EngineError::ResourceLimitExceeded(format!(
            "pool {} is inactive",
            id
        )));
    }
    Ok(pool)
}

/// Apply `delta` bytes to a pool, refusing growth past its quota
pub async fn charge<W: StoreWrite>(
    writer: &mut W,
    pool: PoolId,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    if delta > 0 {
        active_pool(writer, pool).await?;
    }
    writer
        .adjust_pool_usage(pool, delta, true, now)
        .await?
        .ok_or_else(|| {
            EngineError::ResourceLimitExceeded(format!(
                "pool {} cannot take {} more bytes",
                pool, delta
            ))
        })
}

/// Give `size` bytes back to a pool
pub async fn release<W: StoreWrite>(
    writer: &mut W,
    pool: PoolId,
    size: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    writer
        .adjust_pool_usage(pool, -(size as i64), false, now)
        .await?;
    Ok(())
}

/// Move a footprint between pools
///
/// The destination is charged `new_size` in full before the source gets
/// `old_size` back.
pub async fn transfer<W: StoreWrite>(
    writer: &mut W,
    from: PoolId,
    to: PoolId,
    old_size: u64,
    new_size: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    active_pool(writer, to).await?;
    charge(writer, to, new_size as i64, now).await?;
    release(writer, from, old_size, now).await
}

/// Check a payload against the pool's and the grant's upload caps
pub fn check_upload(pool: &Pool, limits: &Limits, payload_len: usize) -> Result<()> {
    let len = payload_len as u64;
    for cap in [pool.max_upload_size, limits.max_upload_size]
        .into_iter()
        .flatten()
    {
        if len > cap {
            return Err(EngineError::ResourceLimitExceeded(format!(
                "payload of {} bytes exceeds the upload cap of {}",
                len, cap
            )));
        }
    }
    Ok(())
}
