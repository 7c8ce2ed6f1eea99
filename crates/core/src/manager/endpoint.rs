//! Endpoint chain builder: what an NSE serves behind its URL.

use std::sync::Arc;

use crate::chain::metadata::MetadataStep;
use crate::chain::{ChainSlot, NetworkServiceStep, PeerIdentity, ServiceChain};
use crate::elements::authorize::{AllowAll, AuthorizeStep, Policy};
use crate::elements::begin::BeginStep;
use crate::elements::mechanisms::SelectMechanismStep;
use crate::elements::timeout::TimeoutStep;
use crate::elements::updatepath::UpdatePathStep;
use crate::monitor::{MonitorServer, MonitorStep};
use crate::tools::token::TokenGenerator;
use crate::transport::ServedNode;

pub struct EndpointBuilder {
    name: String,
    tokens: Arc<dyn TokenGenerator>,
    policy: Arc<dyn Policy>,
    supported_mechanisms: Vec<String>,
    extra_steps: Vec<Arc<dyn NetworkServiceStep>>,
}

pub struct Endpoint {
    pub name: String,
    pub service: Arc<ServiceChain>,
    pub monitor: Arc<MonitorServer>,
}

impl EndpointBuilder {
    pub fn new(name: impl Into<String>, tokens: Arc<dyn TokenGenerator>) -> Self {
        Self {
            name: name.into(),
            tokens,
            policy: Arc::new(AllowAll),
            supported_mechanisms: Vec::new(),
            extra_steps: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn supported_mechanisms(mut self, kinds: Vec<String>) -> Self {
        self.supported_mechanisms = kinds;
        self
    }

    /// Appends user logic (IPAM, counters, the service itself) at the tail.
    pub fn step(mut self, step: Arc<dyn NetworkServiceStep>) -> Self {
        self.extra_steps.push(step);
        self
    }

    pub fn build(self) -> Endpoint {
        let monitor = MonitorServer::new();
        let slot = ChainSlot::new();
        let mut steps: Vec<Arc<dyn NetworkServiceStep>> = vec![
            BeginStep::new(slot.clone()),
            MetadataStep::server(),
            UpdatePathStep::new(self.name.clone(), self.tokens),
            AuthorizeStep::new(self.policy),
            TimeoutStep::new(),
            MonitorStep::new(Arc::clone(&monitor)),
            SelectMechanismStep::new(self.supported_mechanisms),
        ];
        steps.extend(self.extra_steps);

        let chain = ServiceChain::new(steps);
        slot.bind(Arc::clone(&chain));
        Endpoint {
            name: self.name,
            service: chain,
            monitor,
        }
    }
}

impl Endpoint {
    pub fn served_node(&self, identity: PeerIdentity) -> ServedNode {
        ServedNode {
            identity: Some(identity),
            service: Some(Arc::clone(&self.service)),
            monitor: Some(Arc::clone(&self.monitor)),
            nse_registry: None,
            ns_registry: None,
        }
    }
}
