//! Per-entity-name serialisation for the registry plane. Registrations,
//! refreshes and the expiry sweeper's unregister all funnel through one FIFO
//! lock per name.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chain::Ctx;
use crate::status::Result;

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryStep};

pub struct RegistryBeginStep<E: RegistryEntity> {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<E: RegistryEntity> RegistryBeginStep<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            locks: DashMap::new(),
            _marker: std::marker::PhantomData,
        })
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for RegistryBeginStep<E> {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let lock = self.lock_for(entity.name());
        let _guard = lock.lock().await;
        next.register(ctx, entity).await
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        let name = entity.name().to_owned();
        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;
        let result = next.unregister(ctx, entity).await;
        drop(_guard);
        self.locks.remove_if(&name, |_, l| Arc::strong_count(l) == 1);
        result
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
