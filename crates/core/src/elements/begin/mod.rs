//! Per-connection-ID serialisation.
//!
//! All operations on one connection id, whether externally originated or
//! re-issued internally by heal, refresh or timeout, are funneled through a
//! per-id FIFO lock. The element records the last successful request so the
//! [`EventFactory`] can re-issue it idempotently, and cancels pending
//! internal events when the connection closes.

mod event_factory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use event_factory::{EventFactory, ReissueOptions};

use crate::chain::{ChainSlot, Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::{Result, Status};

async fn deadline_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct BeginEntry {
    lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    /// Cancelled on Close; internal events check it before running.
    events: CancellationToken,
    last_request: Mutex<Option<NetworkServiceRequest>>,
}

impl BeginEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            events: CancellationToken::new(),
            last_request: Mutex::new(None),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn events_token(&self) -> &CancellationToken {
        &self.events
    }

    pub(crate) async fn acquire(&self, ctx: &Ctx) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            guard = self.lock.lock() => Ok(guard),
            _ = ctx.cancelled() => Err(Status::Cancelled),
            _ = deadline_or_pending(ctx.deadline()) => Err(Status::DeadlineExceeded),
        }
    }

    pub(crate) fn last_request(&self) -> Option<NetworkServiceRequest> {
        self.last_request.lock().clone()
    }

    fn record(&self, request: &NetworkServiceRequest, conn: &Connection) {
        let mut recorded = request.clone();
        recorded.connection = conn.clone();
        *self.last_request.lock() = Some(recorded);
    }
}

pub struct BeginStep {
    slot: ChainSlot,
    entries: Arc<DashMap<String, Arc<BeginEntry>>>,
}

impl BeginStep {
    /// `slot` must later be bound to the chain this element is part of.
    pub fn new(slot: ChainSlot) -> Arc<Self> {
        Arc::new(Self {
            slot,
            entries: Arc::new(DashMap::new()),
        })
    }

    fn live_entry(&self, id: &str) -> Arc<BeginEntry> {
        loop {
            let entry = Arc::clone(
                self.entries
                    .entry(id.to_owned())
                    .or_insert_with(BeginEntry::new)
                    .value(),
            );
            if !entry.is_closed() {
                return entry;
            }
            // Lost the race with a Close that is still unwinding; drop the
            // tombstoned entry and start a fresh lifecycle.
            self.entries
                .remove_if(id, |_, e| Arc::ptr_eq(e, &entry));
        }
    }

    fn finish_close(&self, id: &str, entry: &Arc<BeginEntry>) {
        entry.closed.store(true, Ordering::Release);
        entry.events.cancel();
        self.entries.remove_if(id, |_, e| Arc::ptr_eq(e, entry));
    }
}

#[async_trait]
impl NetworkServiceStep for BeginStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        if request.connection.id.is_empty() {
            request.connection.id = Uuid::new_v4().to_string();
        }
        let id = request.connection.id.clone();

        // Re-entry from the event factory: the factory already holds the
        // entry lock for this id.
        if ctx.begin_reentry().as_deref() == Some(id.as_str()) {
            let conn = next.request(ctx, request.clone()).await?;
            if let Some(entry) = self.entries.get(&id) {
                entry.record(&request, &conn);
            }
            return Ok(conn);
        }

        let entry = self.live_entry(&id);
        let _guard = entry.acquire(ctx).await?;
        ctx.check()?;

        let factory = EventFactory::new(id.clone(), entry.clone(), self.slot.clone());
        ctx.set_event_factory(factory);

        match next.request(ctx, request.clone()).await {
            Ok(conn) => {
                entry.record(&request, &conn);
                Ok(conn)
            }
            Err(err) => {
                // A first request that never established state leaves nothing
                // to heal; drop the entry.
                if entry.last_request().is_none() {
                    self.entries.remove_if(&id, |_, e| Arc::ptr_eq(e, &entry));
                }
                Err(err)
            }
        }
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        let id = conn.id.clone();

        if ctx.begin_reentry().as_deref() == Some(id.as_str()) {
            let result = next.close(ctx, conn).await;
            if let Some(entry) = self.entries.get(&id).map(|e| Arc::clone(e.value())) {
                self.finish_close(&id, &entry);
            }
            return result;
        }

        // Close on an id we never saw is a no-op.
        let Some(entry) = self.entries.get(&id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };

        let _guard = entry.acquire(ctx).await?;
        if entry.is_closed() {
            return Ok(());
        }
        let factory = EventFactory::new(id.clone(), entry.clone(), self.slot.clone());
        ctx.set_event_factory(factory);

        let result = next.close(ctx, conn).await;
        self.finish_close(&id, &entry);
        result
    }
}
