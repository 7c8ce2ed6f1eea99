//! Endpoint discovery and match-rule evaluation.
//!
//! Resolves the request's network service to an ordered candidate set of
//! endpoints and attaches it to the call context for the selector elements
//! downstream. Candidates come from the local registry chains; matching
//! walks the service's declarative rules with label templating over the
//! client labels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::chain::{Candidates, Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkService, NetworkServiceEndpoint, NetworkServiceRequest};
use crate::registry::{matcher, RegistryChain};
use crate::status::{Result, Status};

pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Applies the service's match rules to the candidate endpoints.
///
/// Expired endpoints are dropped first. The first match whose source
/// selector is a subset of the client labels decides: its routes select
/// endpoints by destination selector (template-expanded); an empty selection
/// falls through to the next match only when the rule says so. With no
/// matches fired, every live endpoint is a candidate.
pub fn match_candidates(
    service: &NetworkService,
    client_labels: &HashMap<String, String>,
    endpoints: &[NetworkServiceEndpoint],
    now: SystemTime,
) -> Vec<NetworkServiceEndpoint> {
    let live: Vec<&NetworkServiceEndpoint> =
        endpoints.iter().filter(|nse| !nse.expired(now)).collect();

    for rule in &service.matches {
        if !matcher::is_subset(client_labels, &rule.source_selector, client_labels) {
            continue;
        }
        let mut selected = Vec::new();
        for route in &rule.routes {
            for nse in &live {
                let empty = HashMap::new();
                let labels = nse.labels_for(&service.name).unwrap_or(&empty);
                if matcher::is_subset(labels, &route.destination_selector, client_labels)
                    && !selected.iter().any(|s: &NetworkServiceEndpoint| s.name == nse.name)
                {
                    selected.push((*nse).clone());
                }
            }
        }
        if rule.fallthrough && selected.is_empty() {
            continue;
        }
        return selected;
    }

    live.into_iter().cloned().collect()
}

pub struct DiscoverStep {
    services: Arc<RegistryChain<NetworkService>>,
    endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>,
}

impl DiscoverStep {
    pub fn new(
        services: Arc<RegistryChain<NetworkService>>,
        endpoints: Arc<RegistryChain<NetworkServiceEndpoint>>,
    ) -> Arc<Self> {
        Arc::new(Self { services, endpoints })
    }

    async fn service_by_name(&self, ctx: &Ctx, name: &str) -> Result<Option<NetworkService>> {
        let template = NetworkService {
            name: name.to_owned(),
            ..Default::default()
        };
        Ok(self
            .services
            .list(ctx, template)
            .await?
            .into_iter()
            .find(|ns| ns.name == name))
    }

    async fn endpoints_for(&self, ctx: &Ctx, service: &str) -> Result<Vec<NetworkServiceEndpoint>> {
        let template = NetworkServiceEndpoint {
            network_service_names: vec![service.to_owned()],
            ..Default::default()
        };
        let mut endpoints = self.endpoints.list(ctx, template).await?;
        // Registry iteration order is arbitrary; a stable input order keeps
        // match routes and round-robin deterministic.
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(endpoints)
    }

    async fn endpoint_by_name(
        &self,
        ctx: &Ctx,
        name: &str,
    ) -> Result<Option<NetworkServiceEndpoint>> {
        let template = NetworkServiceEndpoint {
            name: name.to_owned(),
            ..Default::default()
        };
        Ok(self
            .endpoints
            .list(ctx, template)
            .await?
            .into_iter()
            .find(|nse| nse.name == name))
    }

    async fn discover(&self, ctx: &Ctx, conn: &Connection) -> Result<Candidates> {
        loop {
            // The endpoint name is a hint: honour it while the endpoint is
            // alive, fall back to match-based discovery once it is gone so a
            // stale hint cannot wedge a refresh.
            if !conn.network_service_endpoint_name.is_empty() {
                if let Some(nse) = self
                    .endpoint_by_name(ctx, &conn.network_service_endpoint_name)
                    .await?
                {
                    if !nse.expired(SystemTime::now()) {
                        return Ok(Candidates {
                            network_service: NetworkService {
                                name: conn.network_service.clone(),
                                ..Default::default()
                            },
                            endpoints: vec![nse],
                        });
                    }
                }
                tracing::debug!(
                    endpoint = %conn.network_service_endpoint_name,
                    "hinted endpoint is gone, rediscovering"
                );
            }

            match self.service_by_name(ctx, &conn.network_service).await? {
                Some(service) => {
                    let endpoints = self.endpoints_for(ctx, &service.name).await?;
                    let candidates =
                        match_candidates(&service, &conn.labels, &endpoints, SystemTime::now());
                    if !candidates.is_empty() {
                        return Ok(Candidates {
                            network_service: service,
                            endpoints: candidates,
                        });
                    }
                    self.pause(ctx, || {
                        Status::resource_exhausted(format!(
                            "no endpoint candidates for network service {}",
                            conn.network_service
                        ))
                    })
                    .await?;
                }
                None => {
                    self.pause(ctx, || {
                        Status::not_found(format!(
                            "network service {} not found",
                            conn.network_service
                        ))
                    })
                    .await?;
                }
            }
        }
    }

    /// Sleeps one retry interval inside the caller's deadline, or fails with
    /// the pending error when no time remains.
    async fn pause(&self, ctx: &Ctx, pending: impl Fn() -> Status) -> Result<()> {
        ctx.check().map_err(|_| pending())?;
        let Some(remaining) = ctx.remaining() else {
            return Err(pending());
        };
        if remaining < RETRY_INTERVAL {
            return Err(pending());
        }
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => Ok(()),
            _ = ctx.cancelled() => Err(pending()),
        }
    }
}

#[async_trait]
impl NetworkServiceStep for DiscoverStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let candidates = self.discover(ctx, &request.connection).await?;
        tracing::debug!(
            service = %request.connection.network_service,
            count = candidates.endpoints.len(),
            "discovered endpoint candidates"
        );
        ctx.set_candidates(Arc::new(candidates));
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}
