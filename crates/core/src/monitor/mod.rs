//! Connection monitoring.
//!
//! Each node keeps the current state of the connections it serves and streams
//! change events to subscribers. The first event of every stream is an
//! initial state transfer; later events are updates and deletes in commit
//! order. Subscribers filter with a scope selector matched against the
//! connection's path segments. A subscriber that stops draining its bounded
//! buffer is dropped, which ends its stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, ConnectionState, NetworkServiceRequest};
use crate::status::Result;

pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    InitialStateTransfer,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub connections: HashMap<String, Connection>,
}

/// Filter over path segments: a connection matches when any selector entry
/// matches any of its segments. Empty fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct MonitorScopeSelector {
    pub path_segments: Vec<SegmentSelector>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentSelector {
    pub name: String,
    pub id: String,
}

impl MonitorScopeSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_segment(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            path_segments: vec![SegmentSelector {
                name: name.into(),
                id: id.into(),
            }],
        }
    }

    pub fn matches(&self, conn: &Connection) -> bool {
        if self.path_segments.is_empty() {
            return true;
        }
        self.path_segments.iter().any(|sel| {
            conn.path.segments.iter().any(|seg| {
                (sel.name.is_empty() || sel.name == seg.name)
                    && (sel.id.is_empty() || sel.id == seg.id)
            })
        })
    }
}

struct MonitorWatcher {
    tx: mpsc::Sender<ConnectionEvent>,
    selector: MonitorScopeSelector,
}

pub struct MonitorServer {
    connections: DashMap<String, Connection>,
    watchers: Mutex<HashMap<Uuid, MonitorWatcher>>,
    buffer: usize,
}

impl MonitorServer {
    pub fn new() -> Arc<Self> {
        Self::with_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            watchers: Mutex::new(HashMap::new()),
            buffer,
        })
    }

    /// Open an event stream. The initial state transfer is already queued on
    /// the returned receiver.
    pub fn subscribe(&self, selector: MonitorScopeSelector) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let initial: HashMap<_, _> = self
            .connections
            .iter()
            .filter(|e| selector.matches(e.value()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        // Queue the initial transfer before the watcher can observe any
        // subsequent commit.
        let mut watchers = self.watchers.lock();
        let _ = tx.try_send(ConnectionEvent {
            kind: ConnectionEventKind::InitialStateTransfer,
            connections: initial,
        });
        watchers.insert(Uuid::new_v4(), MonitorWatcher { tx, selector });
        rx
    }

    fn publish(&self, kind: ConnectionEventKind, conn: &Connection) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| {
            if !watcher.selector.matches(conn) {
                return true;
            }
            let event = ConnectionEvent {
                kind,
                connections: [(conn.id.clone(), conn.clone())].into(),
            };
            match watcher.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(watcher = %id, "monitor subscriber too slow, dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn update(&self, conn: Connection) {
        self.connections.insert(conn.id.clone(), conn.clone());
        self.publish(ConnectionEventKind::Update, &conn);
    }

    pub fn delete(&self, mut conn: Connection) {
        if let Some((_, known)) = self.connections.remove(&conn.id) {
            conn = known;
        }
        conn.state = ConnectionState::Down;
        self.publish(ConnectionEventKind::Delete, &conn);
    }

    /// Drop every watcher and all state, ending their streams. Used when the
    /// serving node shuts down.
    pub fn shutdown(&self) {
        self.connections.clear();
        self.watchers.lock().clear();
    }
}

/// Chain element recording connection state into a [`MonitorServer`] on the
/// return path of Request and emitting the tombstone on Close.
pub struct MonitorStep {
    server: Arc<MonitorServer>,
}

impl MonitorStep {
    pub fn new(server: Arc<MonitorServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl NetworkServiceStep for MonitorStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let conn = next.request(ctx, request).await?;
        self.server.update(conn.clone());
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.server.delete(conn.clone());
        next.close(ctx, conn).await
    }
}
