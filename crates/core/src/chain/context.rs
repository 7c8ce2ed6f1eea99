//! Per-call context carrier threaded through every chain element.
//!
//! `Ctx` is a cheap-clone handle over shared per-call state: deadline and
//! cancellation, the authenticated peer, the next-hop client URL, discovery
//! candidates and the begin event factory. Values written by an element are
//! visible to the rest of the suffix and to elements observing the return
//! path, mirroring how the call itself flows.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chain::metadata::{Metadata, Side};
use crate::elements::begin::EventFactory;
use crate::model::{NetworkService, NetworkServiceEndpoint};
use crate::status::{Result, Status};

/// Authenticated identity of the peer on the other side of the transport,
/// in `spiffe://trust-domain/path` form. Issuance is an external collaborator;
/// the SDK only compares these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub spiffe_id: String,
}

impl PeerIdentity {
    pub fn new(spiffe_id: impl Into<String>) -> Self {
        Self {
            spiffe_id: spiffe_id.into(),
        }
    }

    pub fn trust_domain(&self) -> Option<&str> {
        self.spiffe_id
            .strip_prefix("spiffe://")
            .map(|rest| rest.split('/').next().unwrap_or(rest))
    }
}

/// Endpoint candidates produced by discovery for the current request.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub network_service: NetworkService,
    pub endpoints: Vec<NetworkServiceEndpoint>,
}

#[derive(Default)]
struct CtxState {
    peer: RwLock<Option<PeerIdentity>>,
    client_url: RwLock<Option<String>>,
    candidates: RwLock<Option<Arc<Candidates>>>,
    event_factory: RwLock<Option<EventFactory>>,
    /// Connection id for which the caller already holds the begin entry lock.
    begin_reentry: RwLock<Option<String>>,
    metadata_client: RwLock<Option<Metadata>>,
    metadata_server: RwLock<Option<Metadata>>,
}

#[derive(Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    state: Arc<CtxState>,
}

impl Ctx {
    /// Context with no deadline, cancelled only explicitly.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            state: Arc::new(CtxState::default()),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(Instant::now() + timeout);
        ctx
    }

    /// Child sharing this call's state but with its own cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            state: Arc::clone(&self.state),
        }
    }

    /// Detached context for compensating cleanup after cancellation: fresh
    /// cancellation scope, deadline bounded to `bound` from now, fresh state.
    pub fn detached_for_cleanup(&self, bound: Duration) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(Instant::now() + bound);
        ctx
    }

    /// Context a transport hands to the served chain on the other side of a
    /// call: fresh state carrying the caller's identity, cancellation linked
    /// to the caller, same deadline.
    pub fn remote(&self, caller: PeerIdentity) -> Self {
        let ctx = Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            state: Arc::new(CtxState::default()),
        };
        ctx.set_peer(caller);
        ctx
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails fast when the call is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Status::Cancelled);
        }
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            return Err(Status::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.state.peer.read().clone()
    }

    pub fn set_peer(&self, peer: PeerIdentity) {
        *self.state.peer.write() = Some(peer);
    }

    pub fn client_url(&self) -> Option<String> {
        self.state.client_url.read().clone()
    }

    pub fn set_client_url(&self, url: impl Into<String>) {
        *self.state.client_url.write() = Some(url.into());
    }

    pub fn candidates(&self) -> Option<Arc<Candidates>> {
        self.state.candidates.read().clone()
    }

    pub fn set_candidates(&self, candidates: Arc<Candidates>) {
        *self.state.candidates.write() = Some(candidates);
    }

    pub fn event_factory(&self) -> Option<EventFactory> {
        self.state.event_factory.read().clone()
    }

    pub(crate) fn set_event_factory(&self, factory: EventFactory) {
        *self.state.event_factory.write() = Some(factory);
    }

    pub(crate) fn begin_reentry(&self) -> Option<String> {
        self.state.begin_reentry.read().clone()
    }

    pub(crate) fn set_begin_reentry(&self, id: impl Into<String>) {
        *self.state.begin_reentry.write() = Some(id.into());
    }

    pub fn metadata(&self, side: Side) -> Option<Metadata> {
        match side {
            Side::Client => self.state.metadata_client.read().clone(),
            Side::Server => self.state.metadata_server.read().clone(),
        }
    }

    pub fn set_metadata(&self, side: Side, metadata: Metadata) {
        match side {
            Side::Client => *self.state.metadata_client.write() = Some(metadata),
            Side::Server => *self.state.metadata_server.write() = Some(metadata),
        }
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}
