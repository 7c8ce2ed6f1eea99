//! Round-robin endpoint selection over the discovered candidates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::{Result, Status};

pub struct RoundRobinStep {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl NetworkServiceStep for RoundRobinStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let candidates = ctx
            .candidates()
            .ok_or_else(|| Status::internal("no discovery candidates on the call"))?;
        if candidates.endpoints.is_empty() {
            return Err(Status::resource_exhausted(format!(
                "no endpoint candidates for network service {}",
                request.connection.network_service
            )));
        }

        let pick = {
            let mut counters = self.counters.lock();
            let counter = counters
                .entry(candidates.network_service.name.clone())
                .or_insert(0);
            let pick = *counter % candidates.endpoints.len();
            *counter = counter.wrapping_add(1);
            pick
        };
        let selected = &candidates.endpoints[pick];
        tracing::debug!(endpoint = %selected.name, url = %selected.url, "selected endpoint");

        request.connection.network_service_endpoint_name = selected.name.clone();
        ctx.set_client_url(&selected.url);
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Candidates, ServiceChain};
    use crate::model::{NetworkService, NetworkServiceEndpoint};

    fn with_candidates(names: &[&str]) -> Ctx {
        let ctx = Ctx::background();
        ctx.set_candidates(Arc::new(Candidates {
            network_service: NetworkService {
                name: "svc".into(),
                ..Default::default()
            },
            endpoints: names
                .iter()
                .map(|n| NetworkServiceEndpoint {
                    name: (*n).into(),
                    url: format!("tcp://{n}:5003"),
                    ..Default::default()
                })
                .collect(),
        }));
        ctx
    }

    #[tokio::test]
    async fn cycles_through_candidates_per_service() {
        let chain = ServiceChain::new(vec![RoundRobinStep::new()]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let ctx = with_candidates(&["a", "b"]);
            let conn = chain
                .request(&ctx, NetworkServiceRequest::default())
                .await
                .unwrap();
            seen.push(conn.network_service_endpoint_name);
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn installs_the_endpoint_url_for_the_next_hop() {
        let chain = ServiceChain::new(vec![RoundRobinStep::new()]);
        let ctx = with_candidates(&["a"]);
        chain
            .request(&ctx, NetworkServiceRequest::default())
            .await
            .unwrap();
        assert_eq!(ctx.client_url().as_deref(), Some("tcp://a:5003"));
    }

    #[tokio::test]
    async fn empty_candidates_is_resource_exhausted() {
        let chain = ServiceChain::new(vec![RoundRobinStep::new()]);
        let ctx = with_candidates(&[]);
        let err = chain
            .request(&ctx, NetworkServiceRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Status::ResourceExhausted(_)));
    }
}
