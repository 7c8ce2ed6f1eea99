//! Generic chain runtime for the connection plane.
//!
//! A chain is an ordered list of elements sharing two inverse operations.
//! Each element receives a [`Next`] handle over the remaining suffix and may
//! forward the call unchanged, mutate it first, consume it, or post-process
//! the response on the way back. Exactly one `next` invocation per element
//! per call on the happy path; an element that observed a successful forward
//! must compensate when the chain later fails above it.

mod context;
pub mod metadata;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

pub use context::{Candidates, Ctx, PeerIdentity};

use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

/// One element of a connection-plane chain.
#[async_trait]
pub trait NetworkServiceStep: Send + Sync {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection>;

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()>;
}

/// Handle over the remaining suffix of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    steps: &'a [Arc<dyn NetworkServiceStep>],
}

impl<'a> Next<'a> {
    pub fn new(steps: &'a [Arc<dyn NetworkServiceStep>]) -> Self {
        Self { steps }
    }

    pub async fn request(self, ctx: &Ctx, request: NetworkServiceRequest) -> Result<Connection> {
        match self.steps.split_first() {
            Some((head, rest)) => head.request(ctx, request, Next { steps: rest }).await,
            // Tail of the chain: the connection as negotiated so far is the
            // response.
            None => Ok(request.connection),
        }
    }

    pub async fn close(self, ctx: &Ctx, conn: Connection) -> Result<()> {
        match self.steps.split_first() {
            Some((head, rest)) => head.close(ctx, conn, Next { steps: rest }).await,
            None => Ok(()),
        }
    }
}

/// An assembled chain. This is the unit a transport serves and the unit the
/// begin event factory re-enters.
pub struct ServiceChain {
    steps: Vec<Arc<dyn NetworkServiceStep>>,
}

impl ServiceChain {
    pub fn new(steps: Vec<Arc<dyn NetworkServiceStep>>) -> Arc<Self> {
        Arc::new(Self { steps })
    }

    pub async fn request(&self, ctx: &Ctx, request: NetworkServiceRequest) -> Result<Connection> {
        Next::new(&self.steps).request(ctx, request).await
    }

    pub async fn close(&self, ctx: &Ctx, conn: Connection) -> Result<()> {
        Next::new(&self.steps).close(ctx, conn).await
    }
}

/// Late-bound reference to a chain, for elements that need to re-enter the
/// very chain they live in (begin, timeout, heal). Filled once, after
/// construction.
#[derive(Clone, Default)]
pub struct ChainSlot {
    inner: Arc<OnceLock<Arc<ServiceChain>>>,
}

impl ChainSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot. Second and later fills are ignored.
    pub fn bind(&self, chain: Arc<ServiceChain>) {
        let _ = self.inner.set(chain);
    }

    pub fn get(&self) -> Option<Arc<ServiceChain>> {
        self.inner.get().cloned()
    }
}
