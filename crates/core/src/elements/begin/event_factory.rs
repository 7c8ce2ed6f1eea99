//! Handle healers and refreshers use to re-issue operations for one
//! connection id without racing externally-originated calls.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::{ChainSlot, Ctx};
use crate::model::Connection;
use crate::status::{Result, Status};

use super::BeginEntry;

/// Options for a re-issued Request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReissueOptions {
    /// Drop the chosen endpoint and trim the path to the local segment so
    /// discovery runs afresh.
    pub reselect: bool,
    /// Deadline for this single attempt.
    pub timeout: Option<Duration>,
}

impl ReissueOptions {
    pub fn reselect() -> Self {
        Self {
            reselect: true,
            timeout: None,
        }
    }
}

#[derive(Clone)]
pub struct EventFactory {
    id: String,
    entry: Arc<BeginEntry>,
    slot: ChainSlot,
}

impl EventFactory {
    pub(super) fn new(id: String, entry: Arc<BeginEntry>, slot: ChainSlot) -> Self {
        Self { id, entry, slot }
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }

    /// Resolves when the connection closes; internal event loops tie their
    /// lifetime to this.
    pub async fn closed(&self) {
        self.entry.events_token().cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Re-issue the recorded request through the chain, serialised with every
    /// other operation on this id.
    pub async fn request(&self, opts: ReissueOptions) -> Result<Connection> {
        let chain = self
            .slot
            .get()
            .ok_or_else(|| Status::internal("event factory used before chain was bound"))?;

        let ctx = match opts.timeout {
            Some(t) => Ctx::with_timeout(t),
            None => Ctx::background(),
        };

        let _guard = tokio::select! {
            guard = self.entry.acquire(&ctx) => guard?,
            _ = self.entry.events_token().cancelled() => return Err(Status::Cancelled),
        };
        if self.entry.is_closed() {
            return Err(Status::Cancelled);
        }

        let mut request = self
            .entry
            .last_request()
            .ok_or_else(|| Status::internal("no request recorded for connection"))?;

        if opts.reselect {
            request.connection.network_service_endpoint_name.clear();
            let keep = request.connection.path.index + 1;
            request.connection.path.segments.truncate(keep);
        }

        ctx.set_begin_reentry(self.id.clone());
        ctx.set_event_factory(self.clone());
        chain.request(&ctx, request).await
    }

    /// Issue a synthetic Close through the chain.
    pub async fn close(&self) -> Result<()> {
        let chain = self
            .slot
            .get()
            .ok_or_else(|| Status::internal("event factory used before chain was bound"))?;

        if self.entry.is_closed() {
            return Ok(());
        }
        let ctx = Ctx::background();
        let _guard = self.entry.acquire(&ctx).await?;
        if self.entry.is_closed() {
            return Ok(());
        }

        let Some(request) = self.entry.last_request() else {
            return Ok(());
        };

        ctx.set_begin_reentry(self.id.clone());
        ctx.set_event_factory(self.clone());
        chain.close(&ctx, request.connection).await
    }
}
