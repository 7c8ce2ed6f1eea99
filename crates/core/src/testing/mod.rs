//! In-process sandbox: whole mesh domains over the loopback wire.
//!
//! Builds a domain registry plus N manager nodes, lets tests hang endpoints,
//! forwarders and clients off them, and models crashes by taking nodes off
//! the wire. Also home to the counting and error-injection steps tests use
//! as stand-ins for user logic.

mod count;
mod inject;

use std::sync::Arc;

pub use count::CountStep;
pub use inject::InjectErrorStep;

use crate::chain::{Ctx, NetworkServiceStep, PeerIdentity};
use crate::elements::heal::HealOptions;
use crate::manager::{ClientBuilder, EndpointBuilder, ForwarderBuilder, Manager, ManagerConfig};
use crate::model::{NetworkService, NetworkServiceEndpoint};
use crate::registry::{
    ExpireStep, InterdomainStep, MemoryRegistry, RegistryBeginStep, RegistryChain,
    RegistryConnectStep, RegistryRefreshStep, RegistrySlot, RetryStep, SetIdStep,
    StaticDnsResolver, DNS_SERVICE_REGISTRY,
};
use crate::status::Result;
use crate::tools::token::{ExpiringTokenGenerator, TokenGenerator};
use crate::transport::{Loopback, RegistryDialer, ServedNode};

pub struct DomainBuilder {
    name: String,
    nodes: usize,
    token_lifetime: std::time::Duration,
    registry_expiry: std::time::Duration,
}

impl DomainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: 1,
            token_lifetime: crate::tools::token::DEFAULT_TOKEN_LIFETIME,
            registry_expiry: crate::registry::DEFAULT_REGISTRY_EXPIRY,
        }
    }

    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn token_lifetime(mut self, lifetime: std::time::Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Default registration lifetime in the domain registry; endpoints
    /// re-register at its half-life.
    pub fn registry_expiry(mut self, expiry: std::time::Duration) -> Self {
        self.registry_expiry = expiry;
        self
    }

    pub fn build(self) -> Domain {
        let wire = Loopback::new();
        let dns = StaticDnsResolver::new();
        let tokens: Arc<dyn TokenGenerator> =
            Arc::new(ExpiringTokenGenerator::new(self.token_lifetime));

        let registry_url = format!("tcp://registry.{}:5000", self.name);
        let registry_identity = PeerIdentity::new(format!("spiffe://{}/registry", self.name));
        let registry_dialer = wire.dialer(registry_identity.clone());

        let nse_slot = RegistrySlot::new();
        let nse_registry = RegistryChain::new(vec![
            RegistryBeginStep::new(),
            SetIdStep::new(),
            InterdomainStep::new(
                Arc::clone(&dns) as Arc<dyn crate::registry::DnsResolver>,
                Arc::clone(&registry_dialer) as Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
            ),
            ExpireStep::with_default_expiry(nse_slot.clone(), self.registry_expiry),
            MemoryRegistry::new(),
        ]);
        nse_slot.bind(Arc::clone(&nse_registry));

        let ns_slot = RegistrySlot::new();
        let ns_registry = RegistryChain::new(vec![
            RegistryBeginStep::new(),
            InterdomainStep::new(
                Arc::clone(&dns) as Arc<dyn crate::registry::DnsResolver>,
                Arc::clone(&registry_dialer) as Arc<dyn RegistryDialer<NetworkService>>,
            ),
            MemoryRegistry::new(),
        ]);
        ns_slot.bind(Arc::clone(&ns_registry));

        wire.serve(
            registry_url.clone(),
            ServedNode {
                identity: Some(registry_identity),
                nse_registry: Some(Arc::clone(&nse_registry)),
                ns_registry: Some(Arc::clone(&ns_registry)),
                ..Default::default()
            },
        );
        dns.publish(DNS_SERVICE_REGISTRY, &self.name, registry_url.as_str());

        let mut domain = Domain {
            name: self.name,
            wire,
            dns,
            tokens,
            registry_url,
            nse_registry,
            ns_registry,
            nodes: Vec::new(),
        };
        for _ in 0..self.nodes {
            domain.add_node();
        }
        domain
    }
}

pub struct Domain {
    pub name: String,
    pub wire: Arc<Loopback>,
    pub dns: Arc<StaticDnsResolver>,
    pub tokens: Arc<dyn TokenGenerator>,
    pub registry_url: String,
    pub nse_registry: Arc<RegistryChain<NetworkServiceEndpoint>>,
    pub ns_registry: Arc<RegistryChain<NetworkService>>,
    pub nodes: Vec<Node>,
}

pub struct Node {
    pub index: usize,
    pub url: String,
    pub identity: PeerIdentity,
    pub manager: Manager,
}

impl Domain {
    pub fn add_node(&mut self) -> &Node {
        let index = self.nodes.len();
        let url = format!("tcp://nsmgr-{index}.{}:5001", self.name);
        let identity = PeerIdentity::new(format!("spiffe://{}/nsmgr-{index}", self.name));
        let manager = self.build_manager(index, &url, &identity);
        self.wire
            .serve(url.clone(), manager.served_node(identity.clone()));
        self.nodes.push(Node {
            index,
            url,
            identity,
            manager,
        });
        self.nodes.last().unwrap()
    }

    fn build_manager(&self, index: usize, url: &str, identity: &PeerIdentity) -> Manager {
        let dialer = self.wire.dialer(identity.clone());
        Manager::new(ManagerConfig::with_defaults(
            format!("nsmgr-{index}.{}", self.name),
            url,
            self.registry_url.as_str(),
            Arc::clone(&self.tokens),
            Arc::clone(&dialer) as Arc<dyn crate::transport::Dialer>,
            Arc::clone(&dialer) as Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
            Arc::clone(&dialer) as Arc<dyn RegistryDialer<NetworkService>>,
        ))
    }

    /// Restarts the manager on `node`: fresh chains behind the same URL and
    /// identity, connection state gone, registry state preserved (it lives in
    /// the domain registry).
    pub fn restart_manager(&mut self, node: usize) {
        let url = self.nodes[node].url.clone();
        let identity = self.nodes[node].identity.clone();
        self.wire.shutdown(&url);
        let manager = self.build_manager(node, &url, &identity);
        self.wire.serve(url.clone(), manager.served_node(identity));
        self.nodes[node].manager = manager;
    }

    pub async fn register_service(&self, name: &str) -> Result<NetworkService> {
        self.ns_registry
            .register(
                &Ctx::background(),
                NetworkService {
                    name: name.into(),
                    payload: "IP".into(),
                    ..Default::default()
                },
            )
            .await
    }

    /// Builds and serves an endpoint on `node`, registering it through the
    /// node's manager so local bypass applies.
    pub async fn register_endpoint(
        &self,
        node: usize,
        name: &str,
        service: &str,
        steps: Vec<Arc<dyn NetworkServiceStep>>,
    ) -> Result<RunningEndpoint> {
        let url = format!("unix:///var/run/{name}.sock");
        let identity = PeerIdentity::new(format!("spiffe://{}/{name}", self.name));
        let mut builder = EndpointBuilder::new(name, Arc::clone(&self.tokens));
        for step in steps {
            builder = builder.step(step);
        }
        let endpoint = builder.build();
        self.wire
            .serve(url.clone(), endpoint.served_node(identity.clone()));

        // The endpoint keeps its own registration alive: refresh ahead of
        // expiry, bounded retry, connect to its manager's registry.
        let reg_slot = RegistrySlot::new();
        let registry = RegistryChain::new(vec![
            RegistryRefreshStep::new(reg_slot.clone()),
            RetryStep::new(),
            RegistryConnectStep::new(
                self.wire.dialer(identity) as Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
                self.nodes[node].url.as_str(),
            ),
        ]);
        reg_slot.bind(Arc::clone(&registry));

        let registration = registry
            .register(
                &Ctx::background(),
                NetworkServiceEndpoint {
                    name: name.into(),
                    url: url.clone(),
                    network_service_names: vec![service.into()],
                    ..Default::default()
                },
            )
            .await?;

        Ok(RunningEndpoint {
            name: name.into(),
            url,
            node,
            registration,
            registry,
        })
    }

    /// Builds and serves a forwarder on `node`, registering it in the
    /// manager's interpose map.
    pub async fn register_forwarder(&self, node: usize, name: &str) -> Result<String> {
        let manager = &self.nodes[node].manager;
        let identity = PeerIdentity::new(format!("spiffe://{}/forwarder-{name}", self.name));
        let dialer = self.wire.dialer(identity.clone());
        let forwarder = ForwarderBuilder::new(
            name,
            Arc::clone(&self.tokens),
            dialer,
            Arc::clone(&manager.nse_registry),
        )
        .build();

        let url = format!("unix:///var/run/forwarder-{name}.sock");
        self.wire.serve(url.clone(), forwarder.served_node(identity));
        let registered = manager
            .nse_registry
            .register(&Ctx::background(), forwarder.registration(&url))
            .await?;
        Ok(registered.name)
    }

    /// Kills an endpoint: off the wire and out of the registry, the way a
    /// cancelled pod disappears.
    pub async fn kill_endpoint(&self, endpoint: &RunningEndpoint) -> Result<()> {
        self.wire.shutdown(&endpoint.url);
        endpoint
            .registry
            .unregister(&Ctx::background(), endpoint.registration.clone())
            .await
    }

    /// Client chain attached to `node`'s manager.
    pub fn client(&self, node: usize, name: &str) -> ClientBuilder {
        let identity = PeerIdentity::new(format!("spiffe://{}/{name}", self.name));
        ClientBuilder::new(
            name,
            self.nodes[node].url.as_str(),
            Arc::clone(&self.tokens),
            self.wire.dialer(identity),
        )
        .heal_options(HealOptions::default())
    }
}

#[derive(Clone)]
pub struct RunningEndpoint {
    pub name: String,
    pub url: String,
    pub node: usize,
    pub registration: NetworkServiceEndpoint,
    /// The endpoint's registration client chain (refresh + retry + connect).
    pub registry: Arc<RegistryChain<NetworkServiceEndpoint>>,
}

/// Federates `domains` over their static DNS resolvers so `@domain` names
/// resolve across them.
pub fn federate(domains: &[&Domain]) {
    for a in domains {
        for b in domains {
            a.dns
                .publish(DNS_SERVICE_REGISTRY, &b.name, b.registry_url.as_str());
        }
    }
}
