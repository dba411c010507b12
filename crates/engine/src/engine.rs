use std::sync::Arc;

use chrono::Utc;

use crate::access::{Compensation, EvaluationContext};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{Tag, VersionToken, FROZEN_TAG};
use crate::quota;
use crate::store::{StoreProvider, StoreRead, StoreWrite};

/// The decision engine over one storage provider
///
/// Cheap to clone; every clone shares the provider and the configuration.
#[derive(Debug, Clone)]
pub struct Engine<S: StoreProvider> {
    store: S,
    config: Arc<EngineConfig>,
}

impl<S: StoreProvider> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a request authorized by `authorization`
    pub fn context<I, T>(&self, authorization: I) -> EvaluationContext
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        EvaluationContext::new(authorization)
    }

    /// Complete a request: its side effects stay
    pub async fn finish(&self, mut ctx: EvaluationContext) {
        ctx.take_compensations();
        ctx.flush_housekeeping().await;
    }

    /// Fail a request: undo one-shot markers and freezes it caused
    ///
    /// Compensations run newest first, each in its own transaction. Failures
    /// are logged and do not stop the remaining ones.
    pub async fn abort(&self, mut ctx: EvaluationContext) {
        ctx.invalidate();
        for compensation in ctx.take_compensations().into_iter().rev() {
            if let Err(err) = self.compensate(compensation).await {
                tracing::warn!("compensation {:?} failed: {}", compensation, err);
            }
        }
        ctx.flush_housekeeping().await;
    }

    async fn compensate(&self, compensation: Compensation) -> Result<()> {
        let mut writer = self.store.writer().await?;
        match compensation {
            Compensation::ReleaseCapability(id) => {
                writer.set_capability_used(id, None).await?;
            }
            Compensation::Unfreeze(id) => {
                let Some(mut resource) = writer.resource(id).await? else {
                    return Ok(());
                };
                let frozen = Tag::parse(FROZEN_TAG)?;
                if resource.tags.remove(&frozen) {
                    resource.version = VersionToken::fresh();
                    writer.put_resource(&resource).await?;
                    quota::release(&mut writer, resource.pool, frozen.len() as u64, Utc::now())
                        .await?;
                }
            }
        }
        writer.commit().await?;
        tracing::debug!("compensated {:?}", compensation);
        Ok(())
    }
}
