//! Request-scoped evaluation state
//!
//! An [`EvaluationContext`] lives exactly as long as one request. It owns the
//! authorization set, memoizes access results, collects the compensations
//! needed to undo one-shot side effects and tracks spawned housekeeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::model::{CapabilityId, ResourceId};

use super::aggregate::AccessResult;
use super::dispatch::{Scope, TargetKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    scope: Scope,
    target: TargetKind,
    queried: Option<BTreeSet<Uuid>>,
}

/// Undo action for a side effect committed ahead of the request's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Clear the used marker of a one-shot capability
    ReleaseCapability(CapabilityId),
    /// Drop the frozen tag set while exercising a capability
    Unfreeze(ResourceId),
}

#[derive(Debug)]
pub struct EvaluationContext {
    authorization: Vec<String>,
    now: DateTime<Utc>,
    cache: HashMap<CacheKey, Arc<AccessResult>>,
    compensations: Vec<Compensation>,
    housekeeping: Vec<JoinHandle<()>>,
}

impl EvaluationContext {
    pub fn new<I, S>(authorization: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            authorization: authorization.into_iter().map(Into::into).collect(),
            now: Utc::now(),
            cache: HashMap::new(),
            compensations: Vec::new(),
            housekeeping: Vec::new(),
        }
    }

    /// Pin the request clock
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn authorization(&self) -> &[String] {
        &self.authorization
    }

    /// The instant capability windows are checked against
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn cached(
        &self,
        scope: Scope,
        target: TargetKind,
        queried: Option<&BTreeSet<Uuid>>,
    ) -> Option<Arc<AccessResult>> {
        let key = CacheKey {
            scope,
            target,
            queried: queried.cloned(),
        };
        self.cache.get(&key).cloned()
    }

    pub(crate) fn remember(
        &mut self,
        scope: Scope,
        target: TargetKind,
        queried: Option<&BTreeSet<Uuid>>,
        result: Arc<AccessResult>,
    ) {
        let key = CacheKey {
            scope,
            target,
            queried: queried.cloned(),
        };
        self.cache.insert(key, result);
    }

    /// Forget every memoized result; called after each successful write
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn record(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    pub fn compensations(&self) -> &[Compensation] {
        &self.compensations
    }

    pub(crate) fn take_compensations(&mut self) -> Vec<Compensation> {
        std::mem::take(&mut self.compensations)
    }

    pub(crate) fn track(&mut self, handle: JoinHandle<()>) {
        self.housekeeping.push(handle);
    }

    /// Wait for every housekeeping task spawned so far
    pub async fn flush_housekeeping(&mut self) {
        for handle in self.housekeeping.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!("housekeeping task failed: {}", err);
            }
        }
    }
}
