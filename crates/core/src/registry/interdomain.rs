//! Interdomain proxying of registry operations.
//!
//! Names of the form `local@domain` are routed to the `domain`'s registry:
//! the proxy resolves the peer registry URL over DNS SRV, strips the domain
//! suffix, forwards the operation, and re-appends `@domain` on responses.
//! Everything else falls through to the local chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::chain::Ctx;
use crate::status::{Result, Status};
use crate::tools::interdomain;
use crate::transport::{RegistryDialer, DEFAULT_DIAL_TIMEOUT};

use super::{FindSender, RegistryEntity, RegistryNext, RegistryQuery, RegistryStep};

/// SRV service name under which a domain's registry is published.
pub const DNS_SERVICE_REGISTRY: &str = "registry";
/// SRV service name under which a domain's manager proxy is published.
pub const DNS_SERVICE_NSMGR_PROXY: &str = "nsmgr-proxy";

/// DNS resolution seam. Real SRV lookups are an external collaborator.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolves `_<service>._tcp.<domain>`-style SRV records to a dialable
    /// URL.
    async fn resolve(&self, service: &str, domain: &str) -> Result<String>;
}

/// Table-backed resolver for compositions and tests.
#[derive(Default)]
pub struct StaticDnsResolver {
    records: RwLock<HashMap<(String, String), String>>,
}

impl StaticDnsResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, service: &str, domain: &str, url: impl Into<String>) {
        self.records
            .write()
            .insert((service.to_owned(), domain.to_owned()), url.into());
    }
}

#[async_trait]
impl DnsResolver for StaticDnsResolver {
    async fn resolve(&self, service: &str, domain: &str) -> Result<String> {
        self.records
            .read()
            .get(&(service.to_owned(), domain.to_owned()))
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no SRV record for {service}.{domain}")))
    }
}

pub struct InterdomainStep<E: RegistryEntity> {
    resolver: Arc<dyn DnsResolver>,
    dialer: Arc<dyn RegistryDialer<E>>,
}

impl<E: RegistryEntity> InterdomainStep<E> {
    pub fn new(resolver: Arc<dyn DnsResolver>, dialer: Arc<dyn RegistryDialer<E>>) -> Arc<Self> {
        Arc::new(Self { resolver, dialer })
    }

    async fn remote_for(&self, domain: &str) -> Result<Arc<dyn crate::transport::RemoteRegistry<E>>> {
        let url = self
            .resolver
            .resolve(DNS_SERVICE_REGISTRY, domain)
            .await?;
        self.dialer.dial(&url, DEFAULT_DIAL_TIMEOUT).await
    }
}

#[async_trait]
impl<E: RegistryEntity> RegistryStep<E> for InterdomainStep<E> {
    async fn register(&self, ctx: &Ctx, mut entity: E, next: RegistryNext<'_, E>) -> Result<E> {
        let Some(domain) = interdomain::domain_of(entity.name()).map(str::to_owned) else {
            return next.register(ctx, entity).await;
        };
        let (local, _) = interdomain::split(entity.name());
        let local = local.to_owned();
        entity.set_name(local);

        let remote = self.remote_for(&domain).await?;
        let mut registered = remote.register(ctx, entity).await?;
        registered.set_name(interdomain::join(registered.name(), &domain));
        Ok(registered)
    }

    async fn unregister(&self, ctx: &Ctx, mut entity: E, next: RegistryNext<'_, E>) -> Result<()> {
        let Some(domain) = interdomain::domain_of(entity.name()).map(str::to_owned) else {
            return next.unregister(ctx, entity).await;
        };
        let (local, _) = interdomain::split(entity.name());
        let local = local.to_owned();
        entity.set_name(local);

        let remote = self.remote_for(&domain).await?;
        remote.unregister(ctx, entity).await
    }

    async fn find(
        &self,
        ctx: &Ctx,
        mut query: RegistryQuery<E>,
        out: &FindSender<E>,
        next: RegistryNext<'_, E>,
    ) -> Result<()> {
        let Some(domain) = interdomain::domain_of(query.template.name()).map(str::to_owned) else {
            return next.find(ctx, query, out).await;
        };
        let (local, _) = interdomain::split(query.template.name());
        let local = local.to_owned();
        query.template.set_name(local);

        let remote = self.remote_for(&domain).await?;

        // Re-append the domain on everything the remote registry streams.
        let (tx, mut rx) = mpsc::channel(64);
        let inner = async move {
            let result = remote.find(ctx, query, &tx).await;
            drop(tx);
            result
        };
        let forward = async {
            while let Some(mut response) = rx.recv().await {
                let renamed = interdomain::join(response.entity.name(), &domain);
                response.entity.set_name(renamed);
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
    use crate::chain::PeerIdentity;
    use crate::model::NetworkServiceEndpoint;
    use crate::registry::{MemoryRegistry, RegistryChain};
    use crate::transport::{Loopback, ServedNode};

    async fn interdomain_setup() -> (
        Arc<RegistryChain<NetworkServiceEndpoint>>,
        Arc<RegistryChain<NetworkServiceEndpoint>>,
    ) {
        // domain-b: plain memory registry served on the wire.
        let remote_chain = RegistryChain::new(vec![MemoryRegistry::new()]);
        let wire = Loopback::new();
        wire.serve(
            "tcp://registry.domain-b:5002",
            ServedNode {
                identity: Some(PeerIdentity::new("spiffe://domain-b/registry")),
                nse_registry: Some(Arc::clone(&remote_chain)),
                ..Default::default()
            },
        );

        let resolver = StaticDnsResolver::new();
        resolver.publish(
            DNS_SERVICE_REGISTRY,
            "domain-b",
            "tcp://registry.domain-b:5002",
        );

        let dialer = wire.dialer(PeerIdentity::new("spiffe://domain-a/registry"));
        let local_chain = RegistryChain::new(vec![
            InterdomainStep::new(
                resolver,
                dialer as Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
            ),
            MemoryRegistry::new(),
        ]);
        (local_chain, remote_chain)
    }

    #[tokio::test]
    async fn find_resolves_domain_and_restores_suffix() {
        let (local, remote) = interdomain_setup().await;
        let ctx = Ctx::background();

        remote
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: "nse-1".into(),
                    url: "tcp://nse-1.domain-b:5003".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let found = local
            .list(
                &ctx,
                NetworkServiceEndpoint {
                    name: "nse-1@domain-b".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "nse-1@domain-b");
        assert_eq!(found[0].url, "tcp://nse-1.domain-b:5003");
    }

    #[tokio::test]
    async fn register_lands_in_the_remote_domain() {
        let (local, remote) = interdomain_setup().await;
        let ctx = Ctx::background();

        let registered = local
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: "nse-2@domain-b".into(),
                    url: "tcp://nse-2:5003".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(registered.name, "nse-2@domain-b");

        let remote_view = remote
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap();
        assert_eq!(remote_view.len(), 1);
        assert_eq!(remote_view[0].name, "nse-2");
    }

    #[tokio::test]
    async fn local_names_stay_local() {
        let (local, remote) = interdomain_setup().await;
        let ctx = Ctx::background();
        local
            .register(
                &ctx,
                NetworkServiceEndpoint {
                    name: "nse-local".into(),
                    url: "tcp://nse-local:5003".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(remote
            .list(&ctx, NetworkServiceEndpoint::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let (local, _remote) = interdomain_setup().await;
        let err = local
            .list(
                &Ctx::background(),
                NetworkServiceEndpoint {
                    name: "nse-1@domain-c".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Status::NotFound(_)));
    }
}
