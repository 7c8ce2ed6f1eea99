//! Expiration of registry entries.
//!
//! Entries registered without an expiration get `now + default_expiry`. A
//! per-entry timer unregisters the entity through the chain when the promise
//! passes without a refresh; every successful register re-arms it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::chain::Ctx;
use crate::status::Result;

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistrySlot, RegistryStep};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);

pub struct ExpireStep<E: RegistryEntity> {
    slot: RegistrySlot<E>,
    default_expiry: Duration,
    generation: AtomicU64,
    timers: Arc<DashMap<String, (u64, CancellationToken)>>,
}

impl<E: RegistryEntity> ExpireStep<E> {
    pub fn new(slot: RegistrySlot<E>) -> Arc<Self> {
        Self::with_default_expiry(slot, DEFAULT_EXPIRY)
    }

    pub fn with_default_expiry(slot: RegistrySlot<E>, default_expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            slot,
            default_expiry,
            generation: AtomicU64::new(0),
            timers: Arc::new(DashMap::new()),
        })
    }

    fn disarm(&self, name: &str) {
        if let Some((_, (_, token))) = self.timers.remove(name) {
            token.cancel();
        }
    }

    fn arm(&self, entity: &E, expires_at: SystemTime) {
        let name = entity.name().to_owned();
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self
            .timers
            .insert(name.clone(), (generation, token.clone()))
        {
            previous.cancel();
        }

        let wait = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let slot = self.slot.clone();
        let timers = Arc::clone(&self.timers);
        let entity = entity.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            timers.remove_if(&name, |_, (gen, _)| *gen == generation);
            let Some(chain) = slot.get() else { return };
            tracing::debug!(name = %name, kind = E::KIND, "registration expired, unregistering");
            if let Err(error) = chain.unregister(&Ctx::background(), entity).await {
                tracing::warn!(name = %name, %error, "failed to unregister expired entity");
            }
        });
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for ExpireStep<E> {
    async fn register(&self, ctx: &Ctx, mut entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let expires_at = match entity.expiration() {
            Some(at) => at,
            None => {
                let at = SystemTime::now() + self.default_expiry;
                entity.set_expiration(Some(at));
                at
            }
        };
        let registered = next.register(ctx, entity).await?;
        self.arm(&registered, registered.expiration().unwrap_or(expires_at));
        Ok(registered)
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        self.disarm(entity.name());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkServiceEndpoint;
    use crate::registry::{MemoryRegistry, RegistryChain};

    fn expiring_registry(
        expiry: Duration,
    ) -> Arc<RegistryChain<NetworkServiceEndpoint>> {
        let slot = RegistrySlot::new();
        let chain = RegistryChain::new(vec![
            ExpireStep::with_default_expiry(slot.clone(), expiry),
            MemoryRegistry::new(),
        ]);
        slot.bind(Arc::clone(&chain));
        chain
    }

    fn nse(name: &str) -> NetworkServiceEndpoint {
        NetworkServiceEndpoint {
            name: name.into(),
            url: "tcp://127.0.0.1:5001".into(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_disappears_after_expiry() {
        let registry = expiring_registry(Duration::from_secs(1));
        let ctx = Ctx::background();
        let registered = registry.register(&ctx, nse("nse-1")).await.unwrap();
        assert!(registered.expiration_time.is_some());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_re_arms_the_timer() {
        let registry = expiring_registry(Duration::from_secs(1));
        let ctx = Ctx::background();
        registry.register(&ctx, nse("nse-1")).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            registry.register(&ctx, nse("nse-1")).await.unwrap();
        }
        // Every refresh happened inside the expiry window, so the entry is
        // still there 1.8s after the first registration.
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_disarms_the_timer() {
        let registry = expiring_registry(Duration::from_secs(1));
        let ctx = Ctx::background();
        registry.register(&ctx, nse("nse-1")).await.unwrap();
        registry.unregister(&ctx, nse("nse-1")).await.unwrap();

        // Re-register under the same name after the original expiry window;
        // the stale timer must not kill the new registration.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        registry.register(&ctx, nse("nse-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
