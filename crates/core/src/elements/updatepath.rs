//! Appends or refreshes the local hop's path segment.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest, PathSegment};
use crate::status::{Result, Status};
use crate::tools::token::TokenGenerator;

pub struct UpdatePathStep {
    name: String,
    tokens: Arc<dyn TokenGenerator>,
}

impl UpdatePathStep {
    pub fn new(name: impl Into<String>, tokens: Arc<dyn TokenGenerator>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tokens,
        })
    }

    /// Moves the path to the local hop and returns the index it occupied so
    /// the caller can restore it on the return path. The segment id is stable
    /// across refreshes at the same hop; the token is minted anew each pass.
    fn update(&self, ctx: &Ctx, conn: &mut Connection) -> Result<usize> {
        let path = &mut conn.path;
        if path.segments.is_empty() {
            path.segments.push(PathSegment::default());
            path.index = 0;
        } else {
            if path.index >= path.segments.len() {
                return Err(Status::invalid_argument(format!(
                    "path index {} outside of {} segments",
                    path.index,
                    path.segments.len()
                )));
            }
            if path.segments[path.index].name != self.name {
                path.index += 1;
                if path.index == path.segments.len() {
                    path.segments.push(PathSegment::default());
                } else {
                    // Stale tail from a previous selection; this hop owns the
                    // slot now.
                    path.segments[path.index] = PathSegment::default();
                }
            }
        }

        let peer = ctx.peer();
        let (token, expires) = self.tokens.generate(peer.as_ref())?;
        let segment = &mut path.segments[path.index];
        segment.name = self.name.clone();
        if segment.id.is_empty() {
            segment.id = Uuid::new_v4().to_string();
        }
        segment.token = token;
        segment.expires = Some(expires);
        Ok(path.index)
    }
}

#[async_trait]
impl NetworkServiceStep for UpdatePathStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let index = self.update(ctx, &mut request.connection)?;
        let mut conn = next.request(ctx, request).await?;
        conn.path.index = index;
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, mut conn: Connection, next: Next<'_>) -> Result<()> {
        let _ = self.update(ctx, &mut conn)?;
        next.close(ctx, conn).await
    }
}
