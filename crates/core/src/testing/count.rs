//! Counting step: stands in for endpoint user logic in tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

#[derive(Default)]
pub struct CountStep {
    requests: AtomicUsize,
    closes: AtomicUsize,
    unique_requests: Mutex<HashSet<String>>,
    unique_closes: Mutex<HashSet<String>>,
}

impl CountStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn unique_requests(&self) -> usize {
        self.unique_requests.lock().len()
    }

    pub fn unique_closes(&self) -> usize {
        self.unique_closes.lock().len()
    }
}

#[async_trait]
impl NetworkServiceStep for CountStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.unique_requests
            .lock()
            .insert(request.connection.id.clone());
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.unique_closes.lock().insert(conn.id.clone());
        next.close(ctx, conn).await
    }
}
