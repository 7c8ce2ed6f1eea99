//! Injects node/pod/cluster identity from the environment as connection
//! labels, without overwriting labels the client set itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;

const LABELS: &[(&str, &str)] = &[
    ("NODE_NAME", "nodeName"),
    ("POD_NAME", "podName"),
    ("CLUSTER_NAME", "clusterName"),
];

pub struct ClientInfoStep;

impl ClientInfoStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NetworkServiceStep for ClientInfoStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        for (env, label) in LABELS {
            if request.connection.labels.contains_key(*label) {
                continue;
            }
            match std::env::var(env) {
                Ok(value) if !value.is_empty() => {
                    request
                        .connection
                        .labels
                        .insert((*label).to_owned(), value);
                }
                _ => {
                    tracing::debug!(variable = env, "environment variable unset, label skipped");
                }
            }
        }
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}
