//! Client-driven reissue of the Request before any segment token expires.
//!
//! After a successful Request the earliest `expires` across the path decides
//! the schedule: the reissue fires at a configurable fraction of the
//! remaining lifetime (default half). A failed reissue retries with backoff
//! until the expiry itself passes, at which point refresh gives up and the
//! monitor/heal pair observes the connection going down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::elements::begin::{EventFactory, ReissueOptions};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct RefreshStep {
    /// Divisor over the remaining token lifetime (2 = refresh at half-life).
    divisor: u32,
    generation: AtomicU64,
    timers: Arc<DashMap<String, (u64, CancellationToken)>>,
}

impl RefreshStep {
    pub fn new() -> Arc<Self> {
        Self::with_divisor(2)
    }

    pub fn with_divisor(divisor: u32) -> Arc<Self> {
        Arc::new(Self {
            divisor: divisor.max(1),
            generation: AtomicU64::new(0),
            timers: Arc::new(DashMap::new()),
        })
    }

    fn stop(&self, id: &str) {
        if let Some((_, (_, token))) = self.timers.remove(id) {
            token.cancel();
        }
    }

    fn schedule(&self, conn: &Connection, factory: EventFactory) {
        let Some(expires_at) = conn.path.min_expires() else {
            tracing::debug!(id = %conn.id, "no token expiry on the path, refresh disabled");
            return;
        };
        let remaining = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let wait = remaining / self.divisor;

        let id = conn.id.clone();
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.timers.insert(id.clone(), (generation, token.clone())) {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = factory.closed() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            // Retry with backoff until the reissue lands or the token
            // expires. A success re-enters this element and arms the next
            // timer, so this task only drives one refresh interval.
            let mut backoff = RETRY_BACKOFF_MIN;
            loop {
                let left = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                if left.is_zero() {
                    tracing::warn!(id = %id, "token expired before refresh succeeded");
                    return;
                }
                match factory
                    .request(ReissueOptions {
                        reselect: false,
                        timeout: Some(left),
                    })
                    .await
                {
                    Ok(_) => return,
                    Err(error) if error.is_cancelled() => return,
                    Err(error) => {
                        tracing::debug!(id = %id, %error, "refresh attempt failed, backing off");
                    }
                }
                let jitter = rand::rng().random_range(0.8..1.2);
                let delay = backoff.mul_f64(jitter).min(left);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = factory.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
            }
        });
    }
}

#[async_trait]
impl NetworkServiceStep for RefreshStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let conn = next.request(ctx, request).await?;
        if let Some(factory) = ctx.event_factory() {
            self.schedule(&conn, factory);
        } else {
            tracing::debug!(id = %conn.id, "no event factory on the call, refresh disabled");
        }
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.stop(&conn.id);
        next.close(ctx, conn).await
    }
}
