//! Forwards the operation to the next hop over a dialed channel.
//!
//! Channels are created lazily on first use, shared by URL within one chain
//! instance and ref-counted per connection; a connection that reselects to a
//! new URL releases its old channel. Dial failures surface as unavailable
//! and leave no side effects upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::chain::metadata::Side;
use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::{Result, Status};
use crate::transport::{Dialer, RemoteService, DEFAULT_DIAL_TIMEOUT};

/// Channel handle published into per-ID metadata for elements that need the
/// downstream hop (heal's monitor, the forwarder's cross-connect).
#[derive(Clone)]
pub struct DialedChannel(pub Arc<dyn RemoteService>);

struct ChannelEntry {
    channel: Arc<dyn RemoteService>,
    refs: usize,
}

pub struct ConnectStep {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    /// The serving node's own URL. A registry entry can transiently point
    /// back at us (an endpoint that has not re-registered after our
    /// restart); dialing it would loop the chain into itself.
    own_url: Option<String>,
    by_url: Mutex<HashMap<String, ChannelEntry>>,
    per_conn: DashMap<String, (String, Arc<dyn RemoteService>)>,
}

impl ConnectStep {
    pub fn new(dialer: Arc<dyn Dialer>) -> Arc<Self> {
        Self::with_options(dialer, DEFAULT_DIAL_TIMEOUT, None)
    }

    pub fn for_server(dialer: Arc<dyn Dialer>, own_url: impl Into<String>) -> Arc<Self> {
        Self::with_options(dialer, DEFAULT_DIAL_TIMEOUT, Some(own_url.into()))
    }

    pub fn with_options(
        dialer: Arc<dyn Dialer>,
        dial_timeout: Duration,
        own_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            dial_timeout,
            own_url,
            by_url: Mutex::new(HashMap::new()),
            per_conn: DashMap::new(),
        })
    }

    async fn acquire(&self, url: &str) -> Result<Arc<dyn RemoteService>> {
        if let Some(entry) = self.by_url.lock().get_mut(url) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.channel));
        }
        let dialed = tokio::time::timeout(self.dial_timeout, self.dialer.dial(url, self.dial_timeout))
            .await
            .map_err(|_| Status::unavailable(format!("dial {url} timed out")))??;

        let mut by_url = self.by_url.lock();
        let entry = by_url.entry(url.to_owned()).or_insert_with(|| ChannelEntry {
            channel: Arc::clone(&dialed),
            refs: 0,
        });
        entry.refs += 1;
        Ok(Arc::clone(&entry.channel))
    }

    fn release(&self, url: &str) {
        let mut by_url = self.by_url.lock();
        if let Some(entry) = by_url.get_mut(url) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                by_url.remove(url);
            }
        }
    }
}

#[async_trait]
impl NetworkServiceStep for ConnectStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let previous = self.per_conn.get(&id).map(|e| e.clone());
        let url = ctx
            .client_url()
            .or_else(|| previous.as_ref().map(|(url, _)| url.clone()))
            .ok_or_else(|| Status::internal("no next-hop URL on the call"))?;
        if self.own_url.as_deref() == Some(url.as_str()) {
            return Err(Status::unavailable(format!(
                "next hop {url} resolves to this node"
            )));
        }

        let (channel, reused) = match &previous {
            Some((prev_url, channel)) if *prev_url == url => (Arc::clone(channel), true),
            _ => (self.acquire(&url).await?, false),
        };

        match channel.request(ctx, request).await {
            Ok(conn) => {
                if let Some((old_url, _)) = &previous {
                    if !reused {
                        self.release(old_url);
                    }
                }
                self.per_conn
                    .insert(id.clone(), (url, Arc::clone(&channel)));
                if let Some(meta) = ctx.metadata(Side::Client) {
                    meta.insert(DialedChannel(Arc::clone(&channel)));
                }
                ctx.set_peer(channel.peer_identity());
                let conn = next.request(ctx, NetworkServiceRequest::new(conn)).await?;
                Ok(conn)
            }
            Err(err) => {
                if !reused {
                    self.release(&url);
                }
                Err(err)
            }
        }
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        if let Some((_, (url, channel))) = self.per_conn.remove(&conn.id) {
            let result = channel.close(ctx, conn.clone()).await;
            self.release(&url);
            if let Err(error) = result {
                tracing::warn!(id = %conn.id, %error, "downstream close failed");
            }
        }
        next.close(ctx, conn).await
    }
}
