//! Transport seams and the in-process loopback implementation.
//!
//! A real deployment dials gRPC channels; transport setup is an external
//! collaborator, so the SDK only specifies the interfaces it consumes: a
//! [`Dialer`] producing [`RemoteService`] handles for the connection plane
//! and [`RegistryDialer`] producing [`RemoteRegistry`] handles for the
//! registry plane. The [`Loopback`] hub implements both over in-process
//! chains and is what the sandbox (and any single-process composition) uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::chain::{Ctx, PeerIdentity, ServiceChain};
use crate::model::{Connection, NetworkService, NetworkServiceEndpoint, NetworkServiceRequest};
use crate::monitor::{ConnectionEvent, MonitorScopeSelector, MonitorServer};
use crate::registry::{FindSender, RegistryChain, RegistryEntity, RegistryQuery};
use crate::status::{Result, Status};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(300);

/// Connection-plane view of a dialed peer.
#[async_trait]
pub trait RemoteService: Send + Sync {
    fn peer_identity(&self) -> PeerIdentity;

    async fn request(&self, ctx: &Ctx, request: NetworkServiceRequest) -> Result<Connection>;

    async fn close(&self, ctx: &Ctx, conn: Connection) -> Result<()>;

    /// Server-streaming monitor. The stream ends when the serving node shuts
    /// down or drops the subscriber.
    async fn monitor(
        &self,
        selector: MonitorScopeSelector,
    ) -> Result<mpsc::Receiver<ConnectionEvent>>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RemoteService>>;
}

/// Registry-plane view of a dialed peer.
#[async_trait]
pub trait RemoteRegistry<E: RegistryEntity>: Send + Sync {
    async fn register(&self, ctx: &Ctx, entity: E) -> Result<E>;

    async fn unregister(&self, ctx: &Ctx, entity: E) -> Result<()>;

    async fn find(&self, ctx: &Ctx, query: RegistryQuery<E>, out: &FindSender<E>) -> Result<()>;
}

#[async_trait]
pub trait RegistryDialer<E: RegistryEntity>: Send + Sync {
    async fn dial(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RemoteRegistry<E>>>;
}

/// Everything one node serves on its URL.
#[derive(Clone, Default)]
pub struct ServedNode {
    pub identity: Option<PeerIdentity>,
    pub service: Option<Arc<ServiceChain>>,
    pub monitor: Option<Arc<MonitorServer>>,
    pub nse_registry: Option<Arc<RegistryChain<NetworkServiceEndpoint>>>,
    pub ns_registry: Option<Arc<RegistryChain<NetworkService>>>,
}

/// In-process wire: URL → served node. Removing a node makes subsequent
/// dials fail with unavailable, which is how tests model crashes.
#[derive(Default)]
pub struct Loopback {
    nodes: DashMap<String, ServedNode>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: impl Into<String>, node: ServedNode) {
        self.nodes.insert(url.into(), node);
    }

    /// Take the node off the wire; its monitor streams are ended like a
    /// process exit would.
    pub fn shutdown(&self, url: &str) {
        if let Some((_, node)) = self.nodes.remove(url) {
            if let Some(monitor) = node.monitor {
                monitor.shutdown();
            }
        }
    }

    pub fn dialer(self: &Arc<Self>, identity: PeerIdentity) -> Arc<LoopbackDialer> {
        Arc::new(LoopbackDialer {
            wire: Arc::clone(self),
            identity,
        })
    }

    fn lookup(&self, url: &str) -> Result<ServedNode> {
        self.nodes
            .get(url)
            .map(|n| n.clone())
            .ok_or_else(|| Status::unavailable(format!("no listener on {url}")))
    }
}

/// Dialer bound to the local workload's identity.
pub struct LoopbackDialer {
    wire: Arc<Loopback>,
    identity: PeerIdentity,
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn RemoteService>> {
        let node = self.wire.lookup(url)?;
        if node.service.is_none() {
            return Err(Status::unavailable(format!(
                "{url} serves no connection plane"
            )));
        }
        Ok(Arc::new(LoopbackService {
            wire: Arc::clone(&self.wire),
            url: url.to_owned(),
            server_identity: node
                .identity
                .clone()
                .unwrap_or_else(|| PeerIdentity::new(format!("spiffe://loopback/{url}"))),
            caller: self.identity.clone(),
        }))
    }
}

/// A channel resolves the serving node per call, so a process replaced
/// behind the same URL behaves like a restarted peer: the channel keeps
/// working against the new instance, and a missing node fails unavailable.
struct LoopbackService {
    wire: Arc<Loopback>,
    url: String,
    server_identity: PeerIdentity,
    caller: PeerIdentity,
}

impl LoopbackService {
    fn chain(&self) -> Result<Arc<ServiceChain>> {
        self.wire
            .lookup(&self.url)?
            .service
            .ok_or_else(|| Status::unavailable(format!("{} serves no connection plane", self.url)))
    }
}

#[async_trait]
impl RemoteService for LoopbackService {
    fn peer_identity(&self) -> PeerIdentity {
        self.server_identity.clone()
    }

    async fn request(&self, ctx: &Ctx, request: NetworkServiceRequest) -> Result<Connection> {
        let server_ctx = ctx.remote(self.caller.clone());
        self.chain()?.request(&server_ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection) -> Result<()> {
        let server_ctx = ctx.remote(self.caller.clone());
        self.chain()?.close(&server_ctx, conn).await
    }

    async fn monitor(
        &self,
        selector: MonitorScopeSelector,
    ) -> Result<mpsc::Receiver<ConnectionEvent>> {
        let monitor = self
            .wire
            .lookup(&self.url)?
            .monitor
            .ok_or_else(|| Status::unavailable("peer serves no connection monitor"))?;
        Ok(monitor.subscribe(selector))
    }
}

/// Which registry plane of a [`ServedNode`] an entity type lives on.
trait RegistryPlane: RegistryEntity {
    fn chain_of(node: &ServedNode) -> Option<Arc<RegistryChain<Self>>>;
}

impl RegistryPlane for NetworkServiceEndpoint {
    fn chain_of(node: &ServedNode) -> Option<Arc<RegistryChain<Self>>> {
        node.nse_registry.clone()
    }
}

impl RegistryPlane for NetworkService {
    fn chain_of(node: &ServedNode) -> Option<Arc<RegistryChain<Self>>> {
        node.ns_registry.clone()
    }
}

/// Like [`LoopbackService`], resolves the serving node per call so a
/// restarted registry keeps answering behind the same URL.
struct LoopbackRegistry<E: RegistryPlane> {
    wire: Arc<Loopback>,
    url: String,
    caller: PeerIdentity,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<E: RegistryPlane> LoopbackRegistry<E> {
    fn chain(&self) -> Result<Arc<RegistryChain<E>>> {
        E::chain_of(&self.wire.lookup(&self.url)?).ok_or_else(|| {
            Status::unavailable(format!("{} serves no {} registry", self.url, E::KIND))
        })
    }
}

#[async_trait]
impl<E: RegistryPlane> RemoteRegistry<E> for LoopbackRegistry<E> {
    async fn register(&self, ctx: &Ctx, entity: E) -> Result<E> {
        let server_ctx = ctx.remote(self.caller.clone());
        self.chain()?.register(&server_ctx, entity).await
    }

    async fn unregister(&self, ctx: &Ctx, entity: E) -> Result<()> {
        let server_ctx = ctx.remote(self.caller.clone());
        self.chain()?.unregister(&server_ctx, entity).await
    }

    async fn find(&self, ctx: &Ctx, query: RegistryQuery<E>, out: &FindSender<E>) -> Result<()> {
        let server_ctx = ctx.remote(self.caller.clone());
        self.chain()?.find(&server_ctx, query, out).await
    }
}

#[async_trait]
impl RegistryDialer<NetworkServiceEndpoint> for LoopbackDialer {
    async fn dial(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteRegistry<NetworkServiceEndpoint>>> {
        let node = self.wire.lookup(url)?;
        if node.nse_registry.is_none() {
            return Err(Status::unavailable(format!(
                "{url} serves no endpoint registry"
            )));
        }
        Ok(Arc::new(LoopbackRegistry::<NetworkServiceEndpoint> {
            wire: Arc::clone(&self.wire),
            url: url.to_owned(),
            caller: self.identity.clone(),
            _marker: std::marker::PhantomData,
        }))
    }
}

#[async_trait]
impl RegistryDialer<NetworkService> for LoopbackDialer {
    async fn dial(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteRegistry<NetworkService>>> {
        let node = self.wire.lookup(url)?;
        if node.ns_registry.is_none() {
            return Err(Status::unavailable(format!(
                "{url} serves no service registry"
            )));
        }
        Ok(Arc::new(LoopbackRegistry::<NetworkService> {
            wire: Arc::clone(&self.wire),
            url: url.to_owned(),
            caller: self.identity.clone(),
            _marker: std::marker::PhantomData,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dialing_an_unknown_url_is_unavailable() {
        let wire = Loopback::new();
        let dialer = wire.dialer(PeerIdentity::new("spiffe://test/client"));
        let err = match Dialer::dial(dialer.as_ref(), "tcp://nowhere:1", DEFAULT_DIAL_TIMEOUT).await {
            Ok(_) => panic!("expected dial to an unknown url to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, Status::Unavailable(_)));
    }

    #[tokio::test]
    async fn served_chain_answers_and_reports_identity() {
        let wire = Loopback::new();
        wire.serve(
            "tcp://srv:1",
            ServedNode {
                identity: Some(PeerIdentity::new("spiffe://test/server")),
                service: Some(ServiceChain::new(vec![])),
                ..Default::default()
            },
        );
        let dialer = wire.dialer(PeerIdentity::new("spiffe://test/client"));
        let channel = Dialer::dial(dialer.as_ref(), "tcp://srv:1", DEFAULT_DIAL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(channel.peer_identity().spiffe_id, "spiffe://test/server");

        let mut request = NetworkServiceRequest::default();
        request.connection.id = "c1".into();
        let conn = channel.request(&Ctx::background(), request).await.unwrap();
        assert_eq!(conn.id, "c1");
    }
}
