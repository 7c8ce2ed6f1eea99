//! Registry-plane chain runtime.
//!
//! The registry keeps named services and the endpoints advertising them.
//! Its chain mirrors the connection plane with three operations: `register`,
//! `unregister` and a streaming `find`. One generic element family covers
//! both entity types; endpoint-only elements (local-bypass, interpose)
//! implement the trait for [`NetworkServiceEndpoint`] alone.

mod begin;
mod connect;
mod expire;
mod interdomain;
mod interpose;
mod localbypass;
pub mod matcher;
mod memory;
mod refresh;
mod retry;
mod setid;

use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use begin::RegistryBeginStep;
pub use connect::RegistryConnectStep;
pub use expire::{ExpireStep, DEFAULT_EXPIRY as DEFAULT_REGISTRY_EXPIRY};
pub use interdomain::{DnsResolver, InterdomainStep, StaticDnsResolver, DNS_SERVICE_NSMGR_PROXY, DNS_SERVICE_REGISTRY};
pub use interpose::{InterposeMap, InterposeStep, XCONNECT_NSE_PREFIX};
pub use localbypass::LocalBypassStep;
pub use memory::MemoryRegistry;
pub use refresh::RegistryRefreshStep;
pub use retry::RetryStep;
pub use setid::SetIdStep;

use crate::chain::Ctx;
use crate::model::{NetworkService, NetworkServiceEndpoint};
use crate::status::Result;

/// Find query: the embedded entity is a match template, empty fields match
/// everything. `watch` keeps the stream open for change events.
#[derive(Debug, Clone, Default)]
pub struct RegistryQuery<E> {
    pub template: E,
    pub watch: bool,
}

impl<E> RegistryQuery<E> {
    pub fn new(template: E) -> Self {
        Self {
            template,
            watch: false,
        }
    }

    pub fn watched(template: E) -> Self {
        Self {
            template,
            watch: true,
        }
    }
}

/// Item of a find stream. `deleted` marks the tombstone emitted on
/// unregister or expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryResponse<E> {
    pub entity: E,
    pub deleted: bool,
}

impl<E> RegistryResponse<E> {
    pub fn update(entity: E) -> Self {
        Self {
            entity,
            deleted: false,
        }
    }

    pub fn tombstone(entity: E) -> Self {
        Self {
            entity,
            deleted: true,
        }
    }
}

pub type FindSender<E> = mpsc::Sender<RegistryResponse<E>>;

/// Entities a registry chain can carry.
pub trait RegistryEntity: Clone + Default + Send + Sync + std::fmt::Debug + 'static {
    const KIND: &'static str;

    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
    fn expiration(&self) -> Option<SystemTime>;
    fn set_expiration(&mut self, at: Option<SystemTime>);
    /// Whether `self`, used as a query template, matches `candidate`.
    fn matches(&self, candidate: &Self) -> bool;
}

impl RegistryEntity for NetworkServiceEndpoint {
    const KIND: &'static str = "nse";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn expiration(&self) -> Option<SystemTime> {
        self.expiration_time
    }

    fn set_expiration(&mut self, at: Option<SystemTime>) {
        self.expiration_time = at;
    }

    fn matches(&self, candidate: &Self) -> bool {
        matcher::match_endpoint(self, candidate)
    }
}

impl RegistryEntity for NetworkService {
    const KIND: &'static str = "ns";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn expiration(&self) -> Option<SystemTime> {
        None
    }

    fn set_expiration(&mut self, _at: Option<SystemTime>) {}

    fn matches(&self, candidate: &Self) -> bool {
        matcher::match_service(self, candidate)
    }
}

/// One element of a registry chain.
#[async_trait]
pub trait RegistryStep<E: RegistryEntity>: Send + Sync {
    async fn register(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<E>;

    async fn unregister(&self, ctx: &Ctx, entity: E, next: RegistryNext<'_, E>) -> Result<()>;

    async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
        next: RegistryNext<'_, E>,
    ) -> Result<()>;
}

pub struct RegistryNext<'a, E: RegistryEntity> {
    steps: &'a [Arc<dyn RegistryStep<E>>],
}

impl<E: RegistryEntity> Clone for RegistryNext<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: RegistryEntity> Copy for RegistryNext<'_, E> {}

impl<'a, E: RegistryEntity> RegistryNext<'a, E> {
    pub fn new(steps: &'a [Arc<dyn RegistryStep<E>>]) -> Self {
        Self { steps }
    }

    pub async fn register(self, ctx: &Ctx, entity: E) -> Result<E> {
        match self.steps.split_first() {
            Some((head, rest)) => head.register(ctx, entity, RegistryNext { steps: rest }).await,
            None => Ok(entity),
        }
    }

    pub async fn unregister(self, ctx: &Ctx, entity: E) -> Result<()> {
        match self.steps.split_first() {
            Some((head, rest)) => {
                head.unregister(ctx, entity, RegistryNext { steps: rest })
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn find(
        self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
    ) -> Result<()> {
        match self.steps.split_first() {
            Some((head, rest)) => head.find(ctx, query, out, RegistryNext { steps: rest }).await,
            None => Ok(()),
        }
    }
}

pub struct RegistryChain<E: RegistryEntity> {
    steps: Vec<Arc<dyn RegistryStep<E>>>,
}

impl<E: RegistryEntity> RegistryChain<E> {
    pub fn new(steps: Vec<Arc<dyn RegistryStep<E>>>) -> Arc<Self> {
        Arc::new(Self { steps })
    }

    pub async fn register(&self, ctx: &Ctx, entity: E) -> Result<E> {
        RegistryNext::new(&self.steps).register(ctx, entity).await
    }

    pub async fn unregister(&self, ctx: &Ctx, entity: E) -> Result<()> {
        RegistryNext::new(&self.steps).unregister(ctx, entity).await
    }

    pub async fn find(
        &self,
        ctx: &Ctx,
        query: RegistryQuery<E>,
        out: &FindSender<E>,
    ) -> Result<()> {
        RegistryNext::new(&self.steps).find(ctx, query, out).await
    }

    /// Convenience for non-watch finds: collects the whole result set.
    pub async fn list(&self, ctx: &Ctx, template: E) -> Result<Vec<E>> {
        let (tx, mut rx) = mpsc::channel(64);
        let find = async {
            let result = self.find(ctx, RegistryQuery::new(template), &tx).await;
            drop(tx);
            result
        };
        // Drain while the find runs; result sets larger than the buffer
        // would otherwise wedge the sender.
        let collect = async {
            let mut items = Vec::new();
            while let Some(resp) = rx.recv().await {
                if !resp.deleted {
                    items.push(resp.entity);
                }
            }
            items
        };
        let (found, items) = tokio::join!(find, collect);
        found?;
        Ok(items)
    }
}

/// Late-bound reference to a registry chain, for elements (expire, refresh)
/// that re-enter the chain they live in.
pub struct RegistrySlot<E: RegistryEntity> {
    inner: Arc<OnceLock<Arc<RegistryChain<E>>>>,
}

impl<E: RegistryEntity> Clone for RegistrySlot<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: RegistryEntity> Default for RegistrySlot<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(OnceLock::new()),
        }
    }
}

impl<E: RegistryEntity> RegistrySlot<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, chain: Arc<RegistryChain<E>>) {
        let _ = self.inner.set(chain);
    }

    pub fn get(&self) -> Option<Arc<RegistryChain<E>>> {
        self.inner.get().cloned()
    }
}
