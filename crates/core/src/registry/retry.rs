//! Bounded retry of transient registry failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::Ctx;
use crate::status::{Result, Status};

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryStep};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_TRIES: usize = 10;

pub struct RetryStep<E: RegistryEntity> {
    interval: Duration,
    tries: usize,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<E: RegistryEntity> RetryStep<E> {
    pub fn new() -> Arc<Self> {
        Self::with_settings(DEFAULT_INTERVAL, DEFAULT_TRIES)
    }

    pub fn with_settings(interval: Duration, tries: usize) -> Arc<Self> {
        Arc::new(Self {
            interval,
            tries,
            _marker: std::marker::PhantomData,
        })
    }

    async fn backoff(&self, ctx: &Ctx, attempt: usize, error: &Status) -> Result<()> {
        if attempt + 1 >= self.tries || !error.is_transient() {
            return Err(error.clone());
        }
        tracing::debug!(kind = E::KIND, attempt, %error, "transient registry error, retrying");
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => Ok(()),
            _ = ctx.cancelled() => Err(Status::Cancelled),
        }
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for RetryStep<E> {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let mut attempt = 0;
        loop {
            ctx.check()?;
            match next.register(ctx, entity.clone()).await {
                Ok(registered) => return Ok(registered),
                Err(error) => self.backoff(ctx, attempt, &error).await?,
            }
            attempt += 1;
        }
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        let mut attempt = 0;
        loop {
            ctx.check()?;
            match next.unregister(ctx, entity.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => self.backoff(ctx, attempt, &error).await?,
            }
            attempt += 1;
        }
    }

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
        next: RegistryNext<'_, E>,
    ) -> Result<()> {
        // Watch streams deliver partial results before failing; retrying
        // here would duplicate them. Retrying finds is the caller's call.
        next.find(ctx, query, out).await
    }
}
