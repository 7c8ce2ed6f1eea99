//! Forwarder selection at the manager and the forwarder's own cross-connect
//! chain.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chain::metadata::MetadataStep;
use crate::chain::{ChainSlot, Ctx, NetworkServiceStep, Next, PeerIdentity, ServiceChain};
use crate::elements::begin::BeginStep;
use crate::elements::connect::ConnectStep;
use crate::elements::heal::{HealOptions, HealStep};
use crate::elements::mechanisms::MechanismTranslationStep;
use crate::elements::updatepath::UpdatePathStep;
use crate::model::{Connection, NetworkServiceEndpoint, NetworkServiceRequest};
use crate::registry::{matcher, InterposeMap, RegistryChain, XCONNECT_NSE_PREFIX};
use crate::status::{Result, Status};
use crate::tools::token::TokenGenerator;
use crate::transport::{Dialer, ServedNode};

/// Second selection pass at the manager: route the connection through a
/// forwarder whose labels are a subset of the client labels. Candidates are
/// tried in order; the first one that carries the request wins.
pub struct DiscoverForwarderStep {
    forwarders: Arc<InterposeMap>,
}

impl DiscoverForwarderStep {
    pub fn new(forwarders: Arc<InterposeMap>) -> Arc<Self> {
        Arc::new(Self { forwarders })
    }

    fn candidates(&self, conn: &Connection) -> Vec<NetworkServiceEndpoint> {
        let mut all = self.forwarders.all();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all.into_iter()
            .filter(|fwd| {
                fwd.network_service_labels.values().all(|selector| {
                    matcher::is_subset(&conn.labels, selector, &conn.labels)
                })
            })
            .collect()
    }
}

#[async_trait]
impl NetworkServiceStep for DiscoverForwarderStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let candidates = self.candidates(&request.connection);
        if candidates.is_empty() {
            // No forwarders on this node: connect straight to the endpoint.
            return next.request(ctx, request).await;
        }

        let mut last_error = Status::resource_exhausted("no forwarder accepted the connection");
        for forwarder in candidates {
            ctx.set_client_url(&forwarder.url);
            match next.request(ctx, request.clone()).await {
                Ok(conn) => return Ok(conn),
                Err(error) if error.is_transient() => {
                    tracing::warn!(forwarder = %forwarder.name, %error, "forwarder failed, trying next");
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}

/// Resolves the selected endpoint name to its URL through the manager's
/// registry chain (which restores direct URLs for local endpoints) and
/// installs it as the next hop. The last resolved name is remembered per
/// connection, so a heal-trimmed request with the hint cleared still knows
/// where it was going.
pub struct ResolveEndpointStep {
    endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>,
    last: DashMap<String, String>,
}

impl ResolveEndpointStep {
    pub fn new(endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            last: DashMap::new(),
        })
    }

    async fn resolve(&self, ctx: &Ctx, name: &str) -> Result<String> {
        let template = NetworkServiceEndpoint {
            name: name.to_owned(),
            ..Default::default()
        };
        self.endpoints
            .list(ctx, template)
            .await?
            .into_iter()
            .find(|nse| nse.name == name)
            .map(|nse| nse.url)
            .ok_or_else(|| {
                Status::not_found(format!("network service endpoint {name} not found"))
            })
    }
}

#[async_trait]
impl NetworkServiceStep for ResolveEndpointStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let mut name = request.connection.network_service_endpoint_name.clone();
        if name.is_empty() {
            name = self
                .last
                .get(&id)
                .map(|n| n.clone())
                .ok_or_else(|| {
                    Status::invalid_argument("cross connect request names no endpoint")
                })?;
            request.connection.network_service_endpoint_name = name.clone();
        }
        let url = self.resolve(ctx, &name).await?;
        ctx.set_client_url(url);
        let conn = next.request(ctx, request).await?;
        self.last.insert(id, name);
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.last.remove(&conn.id);
        next.close(ctx, conn).await
    }
}

pub struct ForwarderBuilder {
    name: String,
    tokens: Arc<dyn TokenGenerator>,
    dialer: Arc<dyn Dialer>,
    endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>,
}

pub struct Forwarder {
    pub name: String,
    pub service: Arc<ServiceChain>,
    pub monitor: Arc<crate::monitor::MonitorServer>,
}

impl ForwarderBuilder {
    /// `endpoints` is the manager's endpoint registry chain; resolution runs
    /// through it so local endpoints come back with their direct URLs.
    pub fn new(
        name: impl Into<String>,
        tokens: Arc<dyn TokenGenerator>,
        dialer: Arc<dyn Dialer>,
        endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>,
    ) -> Self {
        let name = name.into();
        Self {
            name: if name.starts_with(XCONNECT_NSE_PREFIX) {
                name
            } else {
                format!("{XCONNECT_NSE_PREFIX}{name}")
            },
            tokens,
            dialer,
            endpoints,
        }
    }

    pub fn build(self) -> Forwarder {
        let monitor = crate::monitor::MonitorServer::new();
        let slot = ChainSlot::new();
        let chain = ServiceChain::new(vec![
            BeginStep::new(slot.clone()),
            MetadataStep::server(),
            MetadataStep::client(),
            UpdatePathStep::new(self.name.clone(), self.tokens),
            crate::monitor::MonitorStep::new(Arc::clone(&monitor)),
            // Restore is off for forwarders: a forwarder's re-request must
            // re-route rather than assume the old endpoint.
            HealStep::with_options(HealOptions {
                restore_enabled: false,
                ..Default::default()
            }),
            MechanismTranslationStep::new(),
            ResolveEndpointStep::new(self.endpoints),
            ConnectStep::new(self.dialer),
        ]);
        slot.bind(Arc::clone(&chain));
        Forwarder {
            name: self.name,
            service: chain,
            monitor,
        }
    }
}

impl Forwarder {
    pub fn served_node(&self, identity: PeerIdentity) -> ServedNode {
        ServedNode {
            identity: Some(identity),
            service: Some(Arc::clone(&self.service)),
            monitor: Some(Arc::clone(&self.monitor)),
            nse_registry: None,
            ns_registry: None,
        }
    }

    /// Registration entity for the manager's interpose map.
    pub fn registration(&self, url: impl Into<String>) -> NetworkServiceEndpoint {
        NetworkServiceEndpoint {
            name: self.name.clone(),
            url: url.into(),
            ..Default::default()
        }
    }
}
