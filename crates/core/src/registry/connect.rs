//! Forwards registry operations to a remote registry over the registry
//! dialer. Terminal element of any chain that talks to another process.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chain::Ctx;
use crate::status::{Result, Status};
use crate::transport::{RegistryDialer, RemoteRegistry, DEFAULT_DIAL_TIMEOUT};

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryStep};

pub struct RegistryConnectStep<E: RegistryEntity> {
    dialer: Arc<dyn RegistryDialer<E>>,
    url: String,
    channel: Mutex<Option<Arc<dyn RemoteRegistry<E>>>>,
}

impl<E: RegistryEntity> RegistryConnectStep<E> {
    pub fn new(dialer: Arc<dyn RegistryDialer<E>>, url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            url: url.into(),
            channel: Mutex::new(None),
        })
    }

    async fn channel(&self) -> Result<Arc<dyn RemoteRegistry<E>>> {
        if let Some(channel) = self.channel.lock().clone() {
            return Ok(channel);
        }
        let dialed = self.dialer.dial(&self.url, DEFAULT_DIAL_TIMEOUT).await?;
        *self.channel.lock() = Some(Arc::clone(&dialed));
        Ok(dialed)
    }

    fn drop_channel(&self) {
        *self.channel.lock() = None;
    }

    async fn with_redial<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn RemoteRegistry<E>>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let channel = self.channel().await?;
        match op(channel).await {
            Err(Status::Unavailable(_)) => {
                // The peer may have restarted behind the same URL.
                self.drop_channel();
                let channel = self.channel().await?;
                op(channel).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for RegistryConnectStep<E> {
    async fn register(&self, ctx: &Ctx, entity: E, _next: RegistryNext<'_, E>) -> Result<E> {
        self.with_redial(|channel| {
            let entity = entity.clone();
            async move { channel.register(ctx, entity).await }
        })
        .await
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, _next: RegistryNext<'_, E>) -> Result<()> {
        self.with_redial(|channel| {
            let entity = entity.clone();
            async move { channel.unregister(ctx, entity).await }
        })
        .await
    }

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
        _next: RegistryNext<'_, E>,
    ) -> Result<()> {
        let channel = self.channel().await?;
        match channel.find(ctx, query.clone(), out).await {
            Err(Status::Unavailable(_)) if !query.watch => {
                self.drop_channel();
                let channel = self.channel().await?;
                channel.find(ctx, query, out).await
            }
            other => other,
        }
    }
}
