//! Client-side aggregation of prefixes already used by other connections.
//!
//! Every Request carries the chain's aggregate exclude set (minus the
//! connection's own current addresses) down to the allocator, and every
//! response is validated against it: an allocator that hands out an address
//! inside the effective exclude set gets its connection closed back and the
//! request fails with failed-precondition. Awareness groups keep separate
//! buckets per network-service URL so services inside one group may share
//! address space.

mod file_source;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, IpContext, NetworkServiceRequest};
use crate::status::{Result, Status};

pub use file_source::{decode_prefixes_yaml, PrefixesFile, PrefixesHandle};

const CLEANUP_BOUND: Duration = Duration::from_secs(1);

/// Canonical "NS URL" of a request: the service name plus its sorted labels.
fn ns_url(conn: &Connection) -> String {
    let mut labels: Vec<_> = conn
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    labels.sort();
    format!("{}?{}", conn.network_service, labels.join("&"))
}

fn route_prefixes(ip_context: &IpContext) -> Vec<String> {
    ip_context
        .src_routes
        .iter()
        .chain(ip_context.dst_routes.iter())
        .map(|r| r.prefix.clone())
        .collect()
}

fn within_excluded(addr: &str, excluded: &[String]) -> bool {
    let Ok(addr_net) = addr.parse::<ipnet::IpNet>() else {
        return false;
    };
    excluded.iter().any(|prefix| {
        prefix
            .parse::<ipnet::IpNet>()
            .map(|net| net.contains(&addr_net.addr()))
            .unwrap_or(false)
    })
}

#[derive(Default)]
struct Inner {
    prefixes: BTreeSet<String>,
    group_prefixes: HashMap<String, BTreeSet<String>>,
}

pub struct ExcludedPrefixesStep {
    configured: Option<PrefixesHandle>,
    awareness_groups: Vec<Vec<String>>,
    inner: Mutex<Inner>,
}

impl ExcludedPrefixesStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configured: None,
            awareness_groups: Vec::new(),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// `configured` supplies operator-managed prefixes (e.g. from the YAML
    /// file source); `awareness_groups` are sets of NS URLs whose pools are
    /// kept apart.
    pub fn with_options(
        configured: Option<PrefixesHandle>,
        awareness_groups: Vec<Vec<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            configured,
            awareness_groups,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn group_of(&self, url: &str) -> Option<usize> {
        self.awareness_groups
            .iter()
            .position(|group| group.iter().any(|u| u == url))
    }

    /// The exclude set this request must honour, given its awareness group.
    fn effective_excludes(&self, group: Option<usize>) -> Vec<String> {
        let inner = self.inner.lock();
        let mut out: BTreeSet<String> = inner.prefixes.clone();
        for (idx, urls) in self.awareness_groups.iter().enumerate() {
            if Some(idx) == group {
                continue;
            }
            for url in urls {
                if let Some(bucket) = inner.group_prefixes.get(url) {
                    out.extend(bucket.iter().cloned());
                }
            }
        }
        if let Some(configured) = &self.configured {
            out.extend(configured.get());
        }
        out.into_iter().collect()
    }

    fn record_response(&self, url: &str, in_group: bool, ip_context: &IpContext) {
        let mut used: Vec<String> = ip_context
            .src_ip_addrs
            .iter()
            .chain(ip_context.dst_ip_addrs.iter())
            .cloned()
            .collect();
        used.extend(route_prefixes(ip_context));

        let mut inner = self.inner.lock();
        if in_group {
            inner
                .group_prefixes
                .entry(url.to_owned())
                .or_default()
                .extend(used);
        } else {
            used.extend(ip_context.excluded_prefixes.iter().cloned());
            inner.prefixes.extend(used);
        }
    }

    fn forget_connection(&self, url: &str, ip_context: &IpContext) {
        let mut inner = self.inner.lock();
        for addr in ip_context
            .src_ip_addrs
            .iter()
            .chain(ip_context.dst_ip_addrs.iter())
            .chain(ip_context.excluded_prefixes.iter())
        {
            inner.prefixes.remove(addr);
        }
        for prefix in route_prefixes(ip_context) {
            inner.prefixes.remove(&prefix);
        }
        inner.group_prefixes.remove(url);
    }
}

#[async_trait]
impl NetworkServiceStep for ExcludedPrefixesStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let url = ns_url(&request.connection);
        let group = self.group_of(&url);

        let ip_context = &mut request.connection.context.ip_context;
        let original_excludes = ip_context.excluded_prefixes.clone();

        let mut effective: BTreeSet<String> =
            original_excludes.iter().cloned().collect();
        effective.extend(self.effective_excludes(group));
        // The connection's own addresses must stay allocatable across a
        // refresh.
        for own in ip_context
            .src_ip_addrs
            .iter()
            .chain(ip_context.dst_ip_addrs.iter())
        {
            effective.remove(own);
        }
        let effective: Vec<String> = effective.into_iter().collect();
        ip_context.excluded_prefixes = effective.clone();

        let mut conn = match next.request(ctx, request).await {
            Ok(conn) => conn,
            Err(err) => return Err(err),
        };

        let response_ips = conn.context.ip_context.clone();
        let violation = response_ips
            .src_ip_addrs
            .iter()
            .chain(response_ips.dst_ip_addrs.iter())
            .find(|addr| within_excluded(addr, &effective));
        if let Some(addr) = violation {
            tracing::warn!(id = %conn.id, %addr, "allocated address lies in the exclude set, closing");
            let cleanup = ctx.detached_for_cleanup(CLEANUP_BOUND);
            if let Err(close_err) = next.close(&cleanup, conn.clone()).await {
                tracing::warn!(id = %conn.id, %close_err, "compensating close failed");
            }
            return Err(Status::failed_precondition(format!(
                "address {addr} overlaps the excluded prefixes"
            )));
        }

        self.record_response(&url, group.is_some(), &response_ips);
        conn.context.ip_context.excluded_prefixes = original_excludes;
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        let url = ns_url(&conn);
        self.forget_connection(&url, &conn.context.ip_context);
        next.close(ctx, conn).await
    }
}
