//! Error injection step for failure-path tests.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::{Result, Status};

pub struct InjectErrorStep {
    error: Status,
    /// Remaining failures; negative means fail forever.
    remaining: AtomicIsize,
}

impl InjectErrorStep {
    /// Fails every request with `error`.
    pub fn always(error: Status) -> Arc<Self> {
        Arc::new(Self {
            error,
            remaining: AtomicIsize::new(-1),
        })
    }

    /// Fails the first `times` requests, then forwards.
    pub fn times(error: Status, times: isize) -> Arc<Self> {
        Arc::new(Self {
            error,
            remaining: AtomicIsize::new(times),
        })
    }
}

#[async_trait]
impl NetworkServiceStep for InjectErrorStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining < 0 {
            return Err(self.error.clone());
        }
        if remaining > 0
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                    (r > 0).then_some(r - 1)
                })
                .is_ok()
        {
            return Err(self.error.clone());
        }
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}
