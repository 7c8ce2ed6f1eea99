//! Per-connection heal event loop.

use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::elements::begin::{EventFactory, ReissueOptions};
use crate::model::{Connection, ConnectionState};
use crate::monitor::{ConnectionEvent, ConnectionEventKind};

use super::HealOptions;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

enum Trigger {
    /// Loop should end without healing: the connection closed cleanly.
    Shutdown,
    /// Control-plane loss; the data plane may still be fine.
    ControlPlane,
    /// Data-plane loss; the endpoint must be reselected.
    DataPlane,
}

pub(super) struct EventLoop {
    conn: Connection,
    factory: EventFactory,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    options: HealOptions,
    token: CancellationToken,
}

impl EventLoop {
    pub(super) fn spawn(
        conn: Connection,
        factory: EventFactory,
        events: Option<mpsc::Receiver<ConnectionEvent>>,
        options: HealOptions,
        token: CancellationToken,
    ) {
        let event_loop = Self {
            conn,
            factory,
            events,
            options,
            token,
        };
        tokio::spawn(event_loop.run());
    }

    async fn run(self) {
        let Self {
            conn,
            factory,
            mut events,
            options,
            token,
        } = self;

        let trigger =
            wait_for_trigger(&conn, &factory, &mut events, &options, &token).await;

        let reselect = match trigger {
            Trigger::Shutdown => return,
            Trigger::DataPlane => true,
            Trigger::ControlPlane => !restore_viable(&conn, &options).await,
        };

        heal(conn, factory, token, reselect).await;
    }
}

/// Watches both detectors until one of them reports loss.
async fn wait_for_trigger(
    conn: &Connection,
    factory: &EventFactory,
    events: &mut Option<mpsc::Receiver<ConnectionEvent>>,
    options: &HealOptions,
    token: &CancellationToken,
) -> Trigger {
    let mut liveness_ticker = options
        .liveness_check
        .as_ref()
        .map(|_| tokio::time::interval(options.liveness_interval));
    if let Some(ticker) = liveness_ticker.as_mut() {
        // The first tick is immediate; the probe already passed when the
        // request succeeded.
        ticker.tick().await;
    }

    loop {
        let probe_now = tokio::select! {
            _ = token.cancelled() => return Trigger::Shutdown,
            _ = factory.closed() => return Trigger::Shutdown,
            event = recv_or_pending(events) => {
                match event {
                    None => {
                        // Stream ended without a clean local close: the next
                        // hop went away.
                        tracing::warn!(id = %conn.id, "control plane monitor stream lost");
                        return Trigger::ControlPlane;
                    }
                    Some(event) => {
                        if connection_down(&event, &conn.id) {
                            tracing::warn!(id = %conn.id, "control plane reported connection down");
                            return Trigger::ControlPlane;
                        }
                        false
                    }
                }
            }
            _ = tick_or_pending(&mut liveness_ticker) => true,
        };

        if probe_now && !probe(conn, options).await {
            tracing::warn!(id = %conn.id, "data plane probe failed");
            return Trigger::DataPlane;
        }
    }
}

/// Same-endpoint restore is only worth attempting when the option allows it
/// and a data-plane probe confirms traffic still flows.
async fn restore_viable(conn: &Connection, options: &HealOptions) -> bool {
    if !options.restore_enabled {
        return false;
    }
    if options.liveness_check.is_none() {
        // Without data-plane knowledge, reselect for safety.
        return false;
    }
    probe(conn, options).await
}

async fn probe(conn: &Connection, options: &HealOptions) -> bool {
    let Some(check) = &options.liveness_check else {
        return true;
    };
    let fut = check(conn.clone());
    matches!(
        tokio::time::timeout(options.liveness_timeout, fut).await,
        Ok(true)
    )
}

/// Re-issues the request until it lands or the local token expires; after
/// expiry the downstream is closed instead.
async fn heal(conn: Connection, factory: EventFactory, token: CancellationToken, reselect: bool) {
    let id = conn.id.clone();
    let expires_at = conn.path.current_segment().and_then(|s| s.expires);
    tracing::debug!(id = %id, reselect, "healing connection");

    let mut backoff = BACKOFF_MIN;
    loop {
        let left = match expires_at {
            Some(at) => match at.duration_since(SystemTime::now()) {
                Ok(left) if !left.is_zero() => Some(left),
                _ => {
                    tracing::warn!(id = %id, "token expired before heal succeeded, closing");
                    if let Err(error) = factory.close().await {
                        tracing::warn!(id = %id, %error, "failed to close expired connection");
                    }
                    return;
                }
            },
            None => None,
        };

        match factory
            .request(ReissueOptions {
                reselect,
                timeout: left,
            })
            .await
        {
            Ok(_) => {
                tracing::debug!(id = %id, "heal succeeded");
                return;
            }
            Err(error) if error.is_cancelled() => return,
            Err(error) => {
                tracing::debug!(id = %id, %error, "heal attempt failed, backing off");
            }
        }

        let jitter = rand::rng().random_range(0.8..1.2);
        let mut delay = backoff.mul_f64(jitter);
        if let Some(left) = left {
            delay = delay.min(left);
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = factory.closed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Does the event say our connection is gone or down.
fn connection_down(event: &ConnectionEvent, id: &str) -> bool {
    match event.kind {
        ConnectionEventKind::InitialStateTransfer => false,
        ConnectionEventKind::Delete => event.connections.contains_key(id),
        ConnectionEventKind::Update => event
            .connections
            .get(id)
            .is_some_and(|conn| conn.state == ConnectionState::Down),
    }
}

async fn recv_or_pending(
    events: &mut Option<mpsc::Receiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_or_pending(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
