//! Per-connection-ID typed metadata.
//!
//! Replaces context-bag tricks with an explicit map indexed by connection ID,
//! split into a client-side and a server-side half so a hop that runs both a
//! server chain and a client chain keeps them apart. The element owns the
//! map; downstream elements reach the current connection's entry through the
//! [`Ctx`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

/// Typed bag of values scoped to one connection at one hop.
#[derive(Clone, Default)]
pub struct Metadata {
    entries: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl Metadata {
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.entries.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.entries
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> bool {
        self.entries.lock().remove(&TypeId::of::<T>()).is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Side {
    Client,
    Server,
}

/// Chain element owning the per-ID metadata for one side of a hop. Entries
/// are created on first Request and destroyed on Close, or on a failed
/// first Request.
pub struct MetadataStep {
    side: Side,
    maps: DashMap<String, Metadata>,
}

impl MetadataStep {
    pub fn client() -> Arc<Self> {
        Arc::new(Self {
            side: Side::Client,
            maps: DashMap::new(),
        })
    }

    pub fn server() -> Arc<Self> {
        Arc::new(Self {
            side: Side::Server,
            maps: DashMap::new(),
        })
    }
}

#[async_trait]
impl NetworkServiceStep for MetadataStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let created = !self.maps.contains_key(&id);
        let meta = self.maps.entry(id.clone()).or_default().clone();
        ctx.set_metadata(self.side, meta);

        match next.request(ctx, request).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                if created {
                    self.maps.remove(&id);
                }
                Err(err)
            }
        }
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        if let Some((_, meta)) = self.maps.remove(&conn.id) {
            ctx.set_metadata(self.side, meta);
        }
        next.close(ctx, conn).await
    }
}
