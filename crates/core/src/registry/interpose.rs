//! Interpose (cross-connect) endpoint registration.
//!
//! Forwarders register under a reserved name prefix. They live in a side map
//! consulted only by forwarder selection and are never forwarded to the
//! shared registry nor surfaced on regular finds.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::chain::Ctx;
use crate::model::NetworkServiceEndpoint;
use crate::status::{Result, Status};

use super::{FindSender, RegistryNext, RegistryQuery, RegistryStep};

/// Reserved prefix for cross-connect endpoints. Stable within a deployment:
/// forwarders re-register under it after restarts.
pub const XCONNECT_NSE_PREFIX: &str = "xconnect-nse#";

pub fn is_interpose_name(name: &str) -> bool {
    name.starts_with(XCONNECT_NSE_PREFIX)
}

/// Side map of registered forwarders, shared with forwarder selection.
#[derive(Default)]
pub struct InterposeMap {
    endpoints: DashMap<String, NetworkServiceEndpoint>,
}

impl InterposeMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<NetworkServiceEndpoint> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<NetworkServiceEndpoint> {
        self.endpoints.get(name).map(|e| e.clone())
    }

    fn insert(&self, nse: NetworkServiceEndpoint) {
        self.endpoints.insert(nse.name.clone(), nse);
    }

    fn remove(&self, name: &str) {
        self.endpoints.remove(name);
    }
}

pub struct InterposeStep {
    forwarders: Arc<InterposeMap>,
}

impl InterposeStep {
    pub fn new(forwarders: Arc<InterposeMap>) -> Arc<Self> {
        Arc::new(Self { forwarders })
    }
}

#[async_trait]
impl RegistryStep<NetworkServiceEndpoint> for InterposeStep {
    async fn register(
        &self,
        ctx: &Ctx,
        mut nse: NetworkServiceEndpoint,
        next: RegistryNext<'_, NetworkServiceEndpoint>,
    ) -> Result<NetworkServiceEndpoint> {
        if !is_interpose_name(&nse.name) {
            return next.register(ctx, nse).await;
        }
        if nse.url.is_empty() {
            return Err(Status::invalid_argument(format!(
                "cannot register forwarder {} without a URL",
                nse.name
            )));
        }
        if nse.name == XCONNECT_NSE_PREFIX {
            nse.name = format!("{XCONNECT_NSE_PREFIX}{}", Uuid::new_v4());
        }
        tracing::debug!(name = %nse.name, url = %nse.url, "registering forwarder");
        self.forwarders.insert(nse.clone());
        Ok(nse)
    }

    async fn unregister(
        &self,
        ctx: &Ctx,
        nse: NetworkServiceEndpoint,
        next: RegistryNext<'_, NetworkServiceEndpoint>,
    ) -> Result<()> {
        if is_interpose_name(&nse.name) {
            self.forwarders.remove(&nse.name);
            return Ok(());
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
        next.find(ctx, query, out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, RegistryChain};

    fn chain_with_map() -> (Arc<InterposeMap>, Arc<RegistryChain<NetworkServiceEndpoint>>) {
        let map = InterposeMap::new();
        let chain = RegistryChain::new(vec![
            InterposeStep::new(Arc::clone(&map)),
            MemoryRegistry::new(),
        ]);
        (map, chain)
    }

    #[tokio::test]
    async fn forwarders_stay_out_of_regular_finds() {
        let (map, chain) = chain_with_map();
        let ctx = Ctx::background();

        chain
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: format!("{XCONNECT_NSE_PREFIX}fwd-1"),
                    url: "tcp://127.0.0.1:6001".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let found = chain
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(map.all().len(), 1);
    }

    #[tokio::test]
    async fn bare_prefix_gets_a_generated_suffix() {
        let (map, chain) = chain_with_map();
        let registered = chain
            .register(
                &Ctx::background(),
                NetworkServiceEndpoint {
                    name: XCONNECT_NSE_PREFIX.into(),
                    url: "tcp://127.0.0.1:6001".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(registered.name.len() > XCONNECT_NSE_PREFIX.len());
        assert!(map.get(&registered.name).is_some());
    }

    #[tokio::test]
    async fn unregister_removes_from_the_side_map_only() {
        let (map, chain) = chain_with_map();
        let ctx = Ctx::background();
        let name = format!("{XCONNECT_NSE_PREFIX}fwd-1");
        chain
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: name.clone(),
                    url: "tcp://127.0.0.1:6001".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        chain
            .unregister(
                &ctx,
                NetworkServiceEndpoint {
                    name,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(map.all().is_empty());
    }

    #[tokio::test]
    async fn regular_endpoints_pass_through() {
        let (map, chain) = chain_with_map();
        let ctx = Ctx::background();
        chain
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: "nse-1".into(),
                    url: "tcp://127.0.0.1:5001".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(map.all().is_empty());
        let found = chain
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
