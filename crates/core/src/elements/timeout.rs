//! Server-side expiry of connections whose client stopped refreshing.
//!
//! After a successful Request the previous segment's `expires` (the promise
//! made by the hop that called us) arms a timer. When it fires without a
//! refresh, a synthetic Close runs through the chain's event factory,
//! releasing IPAM and dataplane state. Refreshes re-arm; Close disarms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

pub struct TimeoutStep {
    generation: AtomicU64,
    timers: Arc<DashMap<String, (u64, CancellationToken)>>,
}

impl TimeoutStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            generation: AtomicU64::new(0),
            timers: Arc::new(DashMap::new()),
        })
    }

    fn disarm(&self, id: &str) {
        if let Some((_, (_, token))) = self.timers.remove(id) {
            token.cancel();
        }
    }
}

#[async_trait]
impl NetworkServiceStep for TimeoutStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let conn = next.request(ctx, request).await?;

        // The promise binding us is the caller's segment; a client-side chain
        // (index 0) has nobody to time out for.
        let Some(expires_at) = conn.prev_path_segment().and_then(|s| s.expires) else {
            return Ok(conn);
        };
        let Some(factory) = ctx.event_factory() else {
            tracing::debug!(id = %conn.id, "no event factory on the call, timeout disabled");
            return Ok(conn);
        };

        let id = conn.id.clone();
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.timers.insert(id.clone(), (generation, token.clone())) {
            previous.cancel();
        }

        let wait = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = factory.closed() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            timers.remove_if(&id, |_, (gen, _)| *gen == generation);
            tracing::debug!(id = %id, "connection token expired, closing");
            if let Err(error) = factory.close().await {
                tracing::warn!(id = %id, %error, "failed to close expired connection");
            }
        });

        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.disarm(&conn.id);
        next.close(ctx, conn).await
    }
}
