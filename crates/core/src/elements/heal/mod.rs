//! Connection healing.
//!
//! After every successful Request two detectors watch the downstream hop: a
//! control-plane monitor stream filtered to the local path segment, and an
//! optional data-plane liveness probe. When either reports loss, the
//! connection is re-requested through the begin event factory: against the
//! same endpoint when only the control plane blipped and the data plane
//! still answers (restore), against a fresh one otherwise (reselect).
//! Attempts back off with jitter and are bounded by the local segment's
//! token expiry; past it, the local hop closes the downstream.

mod event_loop;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::chain::metadata::Side;
use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::elements::connect::DialedChannel;
use crate::model::{Connection, NetworkServiceRequest};
use crate::monitor::MonitorScopeSelector;
use crate::status::{Result, Status};

use event_loop::EventLoop;

/// Data-plane probe: answers whether the connection still forwards traffic.
pub type LivenessCheck = dyn Fn(Connection) -> BoxFuture<'static, bool> + Send + Sync;

pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);
const INITIAL_TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
const CLEANUP_BOUND: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct HealOptions {
    pub liveness_check: Option<Arc<LivenessCheck>>,
    pub liveness_interval: Duration,
    pub liveness_timeout: Duration,
    /// Attempt same-endpoint restore on control-plane-only loss. Off for
    /// forwarders, whose re-requests must always re-route. The
    /// manager-restart restore path is experimental; disable to force
    /// reselect on every heal.
    pub restore_enabled: bool,
}

impl Default for HealOptions {
    fn default() -> Self {
        Self {
            liveness_check: None,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            restore_enabled: true,
        }
    }
}

pub struct HealStep {
    options: HealOptions,
    loops: DashMap<String, CancellationToken>,
}

impl HealStep {
    pub fn new() -> Arc<Self> {
        Self::with_options(HealOptions::default())
    }

    pub fn with_options(options: HealOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            loops: DashMap::new(),
        })
    }

    fn stop_loop(&self, id: &str) {
        if let Some((_, token)) = self.loops.remove(id) {
            token.cancel();
        }
    }
}

#[async_trait]
impl NetworkServiceStep for HealStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let conn = next.request(ctx, request).await?;

        let Some(factory) = ctx.event_factory() else {
            tracing::debug!(id = %conn.id, "no event factory on the call, healing disabled");
            return Ok(conn);
        };

        let channel = ctx
            .metadata(Side::Client)
            .and_then(|meta| meta.get::<DialedChannel>());

        // Control-plane detector: subscribe at the next hop, scoped to our
        // own segment, and require the initial state transfer.
        let events = match &channel {
            Some(DialedChannel(remote)) => {
                let segment = conn.current_path_segment().cloned().unwrap_or_default();
                let selector = MonitorScopeSelector::for_segment(segment.name, segment.id);
                match remote.monitor(selector).await {
                    Ok(mut rx) => {
                        let wait = ctx
                            .remaining()
                            .unwrap_or(INITIAL_TRANSFER_TIMEOUT)
                            .min(INITIAL_TRANSFER_TIMEOUT);
                        match tokio::time::timeout(wait, rx.recv()).await {
                            Ok(Some(_initial)) => Some(rx),
                            Ok(None) | Err(_) => {
                                let cleanup = ctx.detached_for_cleanup(CLEANUP_BOUND);
                                let _ = next.close(&cleanup, conn.clone()).await;
                                return Err(Status::unavailable(
                                    "no initial state transfer from the next hop",
                                ));
                            }
                        }
                    }
                    Err(error) => {
                        tracing::debug!(id = %conn.id, %error, "next hop serves no monitor");
                        None
                    }
                }
            }
            None => None,
        };

        if events.is_none() && self.options.liveness_check.is_none() {
            tracing::debug!(id = %conn.id, "no detectors available, healing disabled");
            return Ok(conn);
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.loops.insert(conn.id.clone(), token.clone()) {
            previous.cancel();
        }
        EventLoop::spawn(conn.clone(), factory, events, self.options.clone(), token);

        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.stop_loop(&conn.id);
        next.close(ctx, conn).await
    }
}
