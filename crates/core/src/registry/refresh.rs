//! Client-side re-registration ahead of expiry.
//!
//! Lives in the chain an endpoint uses to register itself. After a
//! successful register that carries an expiration promise, a timer re-issues
//! the registration at a fraction of the remaining lifetime; unregister
//! stops it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::chain::Ctx;
use crate::status::Result;

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistrySlot, RegistryStep};

pub struct RegistryRefreshStep<E: RegistryEntity> {
    slot: RegistrySlot<E>,
    /// Fraction of the remaining lifetime to wait before re-registering,
    /// expressed as a divisor (2 = half-life).
    divisor: u32,
    generation: AtomicU64,
    timers: Arc<DashMap<String, (u64, CancellationToken)>>,
}

impl<E: RegistryEntity> RegistryRefreshStep<E> {
    pub fn new(slot: RegistrySlot<E>) -> Arc<Self> {
        Arc::new(Self {
            slot,
            divisor: 2,
            generation: AtomicU64::new(0),
            timers: Arc::new(DashMap::new()),
        })
    }

    fn stop(&self, name: &str) {
        if let Some((_, (_, token))) = self.timers.remove(name) {
            token.cancel();
        }
    }

    fn schedule(&self, registered: &E) {
        let Some(expires_at) = registered.expiration() else {
            return;
        };
        let remaining = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let wait = remaining / self.divisor;

        let name = registered.name().to_owned();
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self
            .timers
            .insert(name.clone(), (generation, token.clone()))
        {
            previous.cancel();
        }

        let slot = self.slot.clone();
        let timers = Arc::clone(&self.timers);
        let mut entity = registered.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            timers.remove_if(&name, |_, (gen, _)| *gen == generation);
            let Some(chain) = slot.get() else { return };
            // Ask the chain for a fresh expiration instead of re-sending the
            // old promise.
            entity.set_expiration(None);
            if let Err(error) = chain.register(&Ctx::background(), entity).await {
                tracing::warn!(name = %name, %error, "re-registration failed");
            }
        });
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for RegistryRefreshStep<E> {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let registered = next.register(ctx, entity).await?;
        self.schedule(&registered);
        Ok(registered)
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        self.stop(entity.name());
        next.unregister(ctx, entity).await
    }

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
        next: RegistryNext<'_, E>,
    ) -> Result<()> {
        next.find(ctx, query, out).await
    }
}
