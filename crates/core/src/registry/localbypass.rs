//! Rewrites endpoint URLs to the manager's URL on registration so external
//! clients connect through the manager, and restores the original URL on
//! find responses served by the manager itself.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::chain::Ctx;
use crate::model::NetworkServiceEndpoint;
use crate::status::{Result, Status};

use super::{FindSender, RegistryNext, RegistryQuery, RegistryStep};

pub struct LocalBypassStep {
    manager_url: String,
    original_urls: DashMap<String, String>,
}

impl LocalBypassStep {
    pub fn new(manager_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            manager_url: manager_url.into(),
            original_urls: DashMap::new(),
        })
    }

    /// The endpoint's direct URL, for the manager's own dial path.
    pub fn original_url(&self, name: &str) -> Option<String> {
        self.original_urls.get(name).map(|u| u.clone())
    }
}

#[async_trait]
impl RegistryStep<NetworkServiceEndpoint> for LocalBypassStep {
    async fn register(
        &self,
        ctx: &Ctx,
        mut nse: NetworkServiceEndpoint,
        next: RegistryNext<'_, NetworkServiceEndpoint>,
    ) -> Result<NetworkServiceEndpoint> {
        if nse.url.is_empty() {
            return Err(Status::invalid_argument(format!(
                "cannot register endpoint {} without a URL",
                nse.name
            )));
        }

        let name = nse.name.clone();
        let stored = self.original_urls.contains_key(&name);
        let original = nse.url.clone();
        self.original_urls.insert(name.clone(), original.clone());
        nse.url = self.manager_url.clone();

        match next.register(ctx, nse).await {
            Ok(mut registered) => {
                registered.url = original;
                Ok(registered)
            }
            Err(err) => {
                if !stored {
                    self.original_urls.remove(&name);
                }
                Err(err)
            }
        }
    }

    async fn unregister(
        &self,
        ctx: &Ctx,
        mut nse: NetworkServiceEndpoint,
        next: RegistryNext<'_, NetworkServiceEndpoint>,
    ) -> Result<()> {
        if self.original_urls.contains_key(&nse.name) {
            nse.url = self.manager_url.clone();
            let result = next.unregister(ctx, nse.clone()).await;
            self.original_urls.remove(&nse.name);
            return result;
        }
        next.unregister(ctx, nse).await
    }

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<NetworkServiceEndpoint>,
        out: &FindSender<NetworkServiceEndpoint>,
        next: RegistryNext<'_, NetworkServiceEndpoint>,
    ) -> Result<()> {
        // Map responses through the side table while the inner find runs.
        let (tx, mut rx) = mpsc::channel(64);
        let inner = async move {
            let result = next.find(ctx, query, &tx).await;
            // Dropping the sender lets the forwarding loop drain and stop.
            drop(tx);
            result
        };
        let forward = async {
            while let Some(mut response) = rx.recv().await {
                if let Some(original) = self.original_url(&response.entity.name) {
                    response.entity.url = original;
                }
                if out.send(response).await.is_err() {
                    break;
                }
            }
        };
        let (found, ()) = tokio::join!(inner, forward);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, RegistryChain};

    fn nse(name: &str, url: &str) -> NetworkServiceEndpoint {
        NetworkServiceEndpoint {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_stores_manager_url_and_find_restores_original() {
        let bypass = LocalBypassStep::new("tcp://manager:5001");
        let chain = RegistryChain::new(vec![bypass.clone(), MemoryRegistry::new()]);
        let ctx = Ctx::background();

        let registered = chain
            .register(&ctx, nse("nse-1", "unix:///var/run/nse-1.sock"))
            .await
            .unwrap();
        // The registrant keeps seeing its own URL.
        assert_eq!(registered.url, "unix:///var/run/nse-1.sock");

        // A find through the manager's chain restores the direct URL.
        let found = chain
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(found[0].url, "unix:///var/run/nse-1.sock");

        assert_eq!(
            bypass.original_url("nse-1").as_deref(),
            Some("unix:///var/run/nse-1.sock")
        );
    }

    #[tokio::test]
    async fn shared_registry_sees_the_manager_url() {
        let shared = MemoryRegistry::new();
        let chain = RegistryChain::new(vec![
            LocalBypassStep::new("tcp://manager:5001"),
            shared.clone(),
        ]);
        let ctx = Ctx::background();
        chain
            .register(&ctx, nse("nse-1", "unix:///var/run/nse-1.sock"))
            .await
            .unwrap();

        // Reading the shared map directly (as a remote registry would):
        let raw = RegistryChain::new(vec![shared]);
        let found = raw.list(&ctx, NetworkServiceEndpoint::default()).await.unwrap();
        assert_eq!(found[0].url, "tcp://manager:5001");
    }

    #[tokio::test]
    async fn unregister_cleans_the_side_table() {
        let bypass = LocalBypassStep::new("tcp://manager:5001");
        let chain = RegistryChain::new(vec![bypass.clone(), MemoryRegistry::new()]);
        let ctx = Ctx::background();
        chain
            .register(&ctx, nse("nse-1", "unix:///var/run/nse-1.sock"))
            .await
            .unwrap();
        chain.unregister(&ctx, nse("nse-1", "")).await.unwrap();
        assert!(bypass.original_url("nse-1").is_none());
    }

    #[tokio::test]
    async fn register_without_url_is_rejected() {
        let chain = RegistryChain::new(vec![
            LocalBypassStep::new("tcp://manager:5001"),
            MemoryRegistry::new(),
        ]);
        let err = chain
            .register(&Ctx::background(), nse("nse-1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
    }
}
