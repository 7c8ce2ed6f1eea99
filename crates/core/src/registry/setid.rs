//! Resolves registration name conflicts by retrying once with a
//! uuid-suffixed name.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::chain::Ctx;
use crate::status::{Result, Status};

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryStep};

pub struct SetIdStep<E: RegistryEntity> {
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<E: RegistryEntity> SetIdStep<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for SetIdStep<E> {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        match next.register(ctx, entity.clone()).await {
            Err(Status::AlreadyExists(_)) => {
                let mut renamed = entity;
                let fresh = format!("{}-{}", renamed.name(), Uuid::new_v4());
                tracing::debug!(kind = E::KIND, name = %renamed.name(), renamed = %fresh,
                    "name already taken, retrying with generated name");
                renamed.set_name(fresh);
                next.register(ctx, renamed).await
            }
            other => other,
        }
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
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
    use crate::registry::RegistryChain;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first register with AlreadyExists, then accepts.
    struct ConflictOnce {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl RegistryStep<NetworkServiceEndpoint> for ConflictOnce {
        async fn register(
            &self,
            ctx: &Ctx,
            entity: NetworkServiceEndpoint,
            next: RegistryNext<'_, NetworkServiceEndpoint>,
        ) -> Result<NetworkServiceEndpoint> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Status::already_exists(entity.name.clone()));
            }
            next.register(ctx, entity).await
        }

        async fn unregister(
            &self,
            ctx: &Ctx,
            entity: NetworkServiceEndpoint,
            next: RegistryNext<'_, NetworkServiceEndpoint>,
        ) -> Result<()> {
            next.unregister(ctx, entity).await
        }

        async fn find(
            &self,
            ctx: &Ctx,
            query: RegistryQuery<NetworkServiceEndpoint>,
            out: &FindSender<NetworkServiceEndpoint>,
            next: RegistryNext<'_, NetworkServiceEndpoint>,
        ) -> Result<()> {
            let _ = (ctx, query, out, next);
            Ok(())
        }
    }

    #[tokio::test]
    async fn conflict_produces_uuid_suffixed_name() {
        let chain = RegistryChain::new(vec![
            SetIdStep::new(),
            Arc::new(ConflictOnce {
                attempts: AtomicUsize::new(0),
            }),
        ]);
        let registered = chain
            .register(
                &Ctx::background(),
                NetworkServiceEndpoint {
                    name: "nse-1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(registered.name.starts_with("nse-1-"));
        assert_ne!(registered.name, "nse-1");
    }
}
