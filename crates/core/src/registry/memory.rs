//! In-memory terminal element of a registry chain.
//!
//! Keeps the live entity map and fans change events out to watchers. Watch
//! streams first replay the current matches, then deliver change events in
//! commit order until the finder's context ends. A watcher that cannot keep
//! up with its bounded buffer is dropped and its stream terminates with
//! resource-exhausted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::Ctx;
use crate::status::{Result, Status};

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryResponse, RegistryStep};

pub const DEFAULT_WATCHER_BUFFER: usize = 64;

struct Watcher<E> {
    tx: mpsc::Sender<RegistryResponse<E>>,
    overflowed: CancellationToken,
}

pub struct MemoryRegistry<E: RegistryEntity> {
    entities: DashMap<String, E>,
    watchers: Mutex<HashMap<Uuid, Watcher<E>>>,
    watcher_buffer: usize,
}

impl<E: RegistryEntity> MemoryRegistry<E> {
    pub fn new() -> Arc<Self> {
        Self::with_watcher_buffer(DEFAULT_WATCHER_BUFFER)
    }

    pub fn with_watcher_buffer(watcher_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            entities: DashMap::new(),
            watchers: Mutex::new(HashMap::new()),
            watcher_buffer,
        })
    }

    fn all_matches(&self, template: &E) -> Vec<E> {
        self.entities
            .iter()
            .filter(|entry| template.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deliver an event to every watcher, in commit order. Watchers whose
    /// buffer is full are dropped.
    fn broadcast(&self, response: &RegistryResponse<E>) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| match watcher.tx.try_send(response.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(watcher = %id, kind = E::KIND, "watcher buffer overflow, dropping");
                watcher.overflowed.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for MemoryRegistry<E> {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let registered = next.register(ctx, entity).await?;
        self.entities
            .insert(registered.name().to_owned(), registered.clone());
        self.broadcast(&RegistryResponse::update(registered.clone()));
        Ok(registered)
    }

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        if let Some((_, removed)) = self.entities.remove(entity.name()) {
            self.broadcast(&RegistryResponse::tombstone(removed));
        }
        next.unregister(ctx, entity).await
    }

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
        next: RegistryNext<'_, E>,
    ) -> Result<()> {
        if !query.watch {
            for entity in self.all_matches(&query.template) {
                if out.send(RegistryResponse::update(entity)).await.is_err() {
                    return Ok(());
                }
            }
            return next.find(ctx, query, out).await;
        }

        let (tx, mut rx) = mpsc::channel(self.watcher_buffer);
        let overflowed = CancellationToken::new();
        let id = Uuid::new_v4();
        // Snapshot the replay set under the watchers lock so no commit can
        // slip between the replay and the event stream.
        let replay = {
            let mut watchers = self.watchers.lock();
            watchers.insert(
                id,
                Watcher {
                    tx,
                    overflowed: overflowed.clone(),
                },
            );
            self.all_matches(&query.template)
        };

        let overflow_err = || Status::resource_exhausted("watcher event buffer overflowed");
        let result = async {
            for entity in replay {
                if out.send(RegistryResponse::update(entity)).await.is_err() {
                    return Ok(());
                }
            }
            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = overflowed.cancelled() => return Err(overflow_err()),
                    event = rx.recv() => match event {
                        Some(event) => event,
                        // Sender gone: either we were dropped for overflowing
                        // or the registry shut down.
                        None if overflowed.is_cancelled() => return Err(overflow_err()),
                        None => return Ok(()),
                    },
                };
                if !query.template.matches(&event.entity) {
                    continue;
                }
                // The downstream send must stay interruptible, otherwise a
                // stalled finder would keep a dropped watcher alive forever.
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = overflowed.cancelled() => return Err(overflow_err()),
                    sent = out.send(event) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        .await;

        self.watchers.lock().remove(&id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkServiceEndpoint;

    fn nse(name: &str) -> NetworkServiceEndpoint {
        NetworkServiceEndpoint {
            name: name.into(),
            url: format!("tcp://10.0.0.1/{name}"),
            ..Default::default()
        }
    }

    fn chain() -> Arc<super::super::RegistryChain<NetworkServiceEndpoint>> {
        super::super::RegistryChain::new(vec![MemoryRegistry::new()])
    }

    #[tokio::test]
    async fn register_find_unregister_round_trip() {
        let registry = chain();
        let ctx = Ctx::background();

        registry.register(&ctx, nse("nse-1")).await.unwrap();
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "nse-1");

        registry.unregister(&ctx, nse("nse-1")).await.unwrap();
        let found = registry
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn watch_replays_then_streams_events() {
        let registry = chain();
        let ctx = Ctx::background();
        registry.register(&ctx, nse("nse-1")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let watch_ctx = ctx.child();
        let registry_clone = Arc::clone(&registry);
        let watcher = tokio::spawn(async move {
            registry_clone
                .find(
                    &watch_ctx,
                    RegistryQuery::watched(NetworkServiceEndpoint::default()),
                    &tx,
                )
                .await
        });

        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.entity.name, "nse-1");
        assert!(!replayed.deleted);

        registry.register(&ctx, nse("nse-2")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().entity.name, "nse-2");

        registry.unregister(&ctx, nse("nse-1")).await.unwrap();
        let tombstone = rx.recv().await.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.entity.name, "nse-1");

        ctx.cancel();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_watcher_is_dropped_with_resource_exhausted() {
        let registry: Arc<MemoryRegistry<NetworkServiceEndpoint>> =
            MemoryRegistry::with_watcher_buffer(1);
        let chain = super::super::RegistryChain::new(vec![registry]);
        let ctx = Ctx::background();

        // The watcher never drains `out`, so the internal buffer (size 1)
        // overflows on the second event.
        let (tx, _rx) = mpsc::channel(1);
        let watch_ctx = ctx.child();
        let chain_clone = Arc::clone(&chain);
        let watcher = tokio::spawn(async move {
            chain_clone
                .find(
                    &watch_ctx,
                    RegistryQuery::watched(NetworkServiceEndpoint::default()),
                    &tx,
                )
                .await
        });

        // Let the watcher install itself.
        tokio::task::yield_now().await;
        for i in 0..8 {
            chain.register(&ctx, nse(&format!("nse-{i}"))).await.unwrap();
        }

        let err = watcher.await.unwrap().unwrap_err();
        assert!(matches!(err, Status::ResourceExhausted(_)));
    }
}
