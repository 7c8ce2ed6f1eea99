//! Chain compositions: the per-node manager, plus the client, endpoint and
//! forwarder chain builders.
//!
//! A manager terminates client connections on its URL, authorises and
//! bookkeeps them, discovers an endpoint, optionally routes through a
//! forwarder, and connects to the next hop. Its registry chains keep
//! forwarders in the interpose map, rewrite endpoint URLs for local bypass
//! and forward everything else to the domain registry.

mod client;
mod endpoint;
mod forwarder;

use std::sync::Arc;

pub use client::ClientBuilder;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use forwarder::{DiscoverForwarderStep, Forwarder, ForwarderBuilder, ResolveEndpointStep};

use crate::chain::metadata::MetadataStep;
use crate::chain::{ChainSlot, ServiceChain};
use crate::elements::authorize::{AllowAll, AuthorizeStep, Policy};
use crate::elements::begin::BeginStep;
use crate::elements::connect::ConnectStep;
use crate::elements::discover::DiscoverStep;
use crate::elements::heal::{HealOptions, HealStep};
use crate::elements::roundrobin::RoundRobinStep;
use crate::elements::timeout::TimeoutStep;
use crate::elements::updatepath::UpdatePathStep;
use crate::model::{NetworkService, NetworkServiceEndpoint};
use crate::monitor::{MonitorServer, MonitorStep};
use crate::registry::{
    InterposeMap, InterposeStep, LocalBypassStep, RegistryBeginStep, RegistryChain,
    RegistryConnectStep,
};
use crate::tools::token::TokenGenerator;
use crate::transport::{Dialer, RegistryDialer, ServedNode};

pub struct ManagerConfig {
    pub name: String,
    pub url: String,
    /// Domain registry this manager forwards registrations and finds to.
    pub registry_url: String,
    pub tokens: Arc<dyn TokenGenerator>,
    pub policy: Arc<dyn Policy>,
    pub dialer: Arc<dyn Dialer>,
    pub nse_registry_dialer: Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
    pub ns_registry_dialer: Arc<dyn RegistryDialer<NetworkService>>,
}

impl ManagerConfig {
    pub fn with_defaults(
        name: impl Into<String>,
        url: impl Into<String>,
        registry_url: impl Into<String>,
        tokens: Arc<dyn TokenGenerator>,
        dialer: Arc<dyn Dialer>,
        nse_registry_dialer: Arc<dyn RegistryDialer<NetworkServiceEndpoint>>,
        ns_registry_dialer: Arc<dyn RegistryDialer<NetworkService>>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            registry_url: registry_url.into(),
            tokens,
            policy: Arc::new(AllowAll),
            dialer,
            nse_registry_dialer,
            ns_registry_dialer,
        }
    }
}

pub struct Manager {
    pub name: String,
    pub url: String,
    pub service: Arc<ServiceChain>,
    pub monitor: Arc<MonitorServer>,
    pub nse_registry: Arc<RegistryChain<NetworkServiceEndpoint>>,
    pub ns_registry: Arc<RegistryChain<NetworkService>>,
    pub forwarders: Arc<InterposeMap>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        let forwarders = InterposeMap::new();

        let nse_registry = RegistryChain::new(vec![
            RegistryBeginStep::new(),
            InterposeStep::new(Arc::clone(&forwarders)),
            LocalBypassStep::new(config.url.clone()),
            RegistryConnectStep::new(
                Arc::clone(&config.nse_registry_dialer),
                config.registry_url.clone(),
            ),
        ]);

        let ns_registry = RegistryChain::new(vec![
            RegistryBeginStep::new(),
            RegistryConnectStep::new(
                Arc::clone(&config.ns_registry_dialer),
                config.registry_url.clone(),
            ),
        ]);

        let monitor = MonitorServer::new();
        let slot = ChainSlot::new();
        let service = ServiceChain::new(vec![
            BeginStep::new(slot.clone()),
            MetadataStep::server(),
            MetadataStep::client(),
            UpdatePathStep::new(config.name.clone(), Arc::clone(&config.tokens)),
            AuthorizeStep::new(Arc::clone(&config.policy)),
            TimeoutStep::new(),
            MonitorStep::new(Arc::clone(&monitor)),
            // The manager heals its own downstream leg; with no data-plane
            // probe here, every heal reselects.
            HealStep::with_options(HealOptions {
                restore_enabled: false,
                ..HealOptions::default()
            }),
            DiscoverStep::new(Arc::clone(&ns_registry), Arc::clone(&nse_registry)),
            RoundRobinStep::new(),
            DiscoverForwarderStep::new(Arc::clone(&forwarders)),
            ConnectStep::for_server(Arc::clone(&config.dialer), config.url.clone()),
        ]);
        slot.bind(Arc::clone(&service));

        Self {
            name: config.name,
            url: config.url,
            service,
            monitor,
            nse_registry,
            ns_registry,
            forwarders,
        }
    }

    /// Everything this manager serves on its URL.
    pub fn served_node(&self, identity: crate::chain::PeerIdentity) -> ServedNode {
        ServedNode {
            identity: Some(identity),
            service: Some(Arc::clone(&self.service)),
            monitor: Some(Arc::clone(&self.monitor)),
            nse_registry: Some(Arc::clone(&self.nse_registry)),
            ns_registry: Some(Arc::clone(&self.ns_registry)),
        }
    }
}
