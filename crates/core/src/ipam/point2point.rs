//! Point-to-point address allocation: one /32 (or /128) pair per connection.
//!
//! Allocation is deterministic: the lowest free addresses win, and released
//! pairs are handed out again in order. The allocator keys by connection id,
//! so a refresh returns the previously assigned pair unless the request's
//! exclude set no longer permits it.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, NetworkServiceRequest, Route};
use crate::status::{Result, Status};

use super::ippool::{ip_of, IpPool};

struct PrefixPool {
    free: IpPool,
    v4: bool,
}

impl PrefixPool {
    fn masked(&self, ip: IpAddr) -> String {
        if self.v4 {
            format!("{ip}/32")
        } else {
            format!("{ip}/128")
        }
    }
}

#[derive(Clone)]
struct AllocatedPair {
    pool: usize,
    dst: IpAddr,
    src: IpAddr,
}

pub struct P2pIpamStep {
    pools: Arc<Mutex<Vec<PrefixPool>>>,
    connections: DashMap<String, AllocatedPair>,
}

impl P2pIpamStep {
    pub fn new(prefixes: impl IntoIterator<Item = IpNet>) -> Arc<Self> {
        let pools = prefixes
            .into_iter()
            .map(|net| PrefixPool {
                free: IpPool::from_net(net),
                v4: matches!(net, IpNet::V4(_)),
            })
            .collect();
        Arc::new(Self {
            pools: Arc::new(Mutex::new(pools)),
            connections: DashMap::new(),
        })
    }

    fn excluded(excludes: &[String], v4: bool) -> IpPool {
        let mut pool = IpPool::new();
        for prefix in excludes {
            if let Ok(net) = prefix.parse::<IpNet>() {
                if matches!(net, IpNet::V4(_)) == v4 {
                    pool.add_net(net);
                }
            }
        }
        pool
    }

    fn allocate(&self, excludes: &[String]) -> Result<AllocatedPair> {
        let mut pools = self.pools.lock();
        for (idx, pool) in pools.iter_mut().enumerate() {
            let excluded = Self::excluded(excludes, pool.v4);
            // Trial allocation against a view with the excludes applied;
            // only a successful pair is taken out of the real pool.
            let mut view = pool.free.clone();
            for (start, end) in excluded.ranges() {
                view.remove_range(start, end);
            }
            let Some(dst) = view.pull() else { continue };
            let Some(src) = view.pull() else { continue };

            pool.free.remove_range(dst, dst);
            pool.free.remove_range(src, src);
            return Ok(AllocatedPair {
                pool: idx,
                dst: ip_of(dst, pool.v4),
                src: ip_of(src, pool.v4),
            });
        }
        Err(Status::resource_exhausted(
            "no free address pair in the configured prefixes",
        ))
    }

    fn release(&self, pair: &AllocatedPair) {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(pair.pool) {
            pool.free.add_ip(pair.dst);
            pool.free.add_ip(pair.src);
        }
    }

    fn pair_permitted(pair: &AllocatedPair, excludes: &[String]) -> bool {
        let v4 = pair.dst.is_ipv4();
        let excluded = Self::excluded(excludes, v4);
        !excluded.contains(pair.dst) && !excluded.contains(pair.src)
    }

    fn write_ip_context(&self, conn: &mut Connection, pair: &AllocatedPair) {
        let pools = self.pools.lock();
        let Some(pool) = pools.get(pair.pool) else {
            return;
        };
        let dst = pool.masked(pair.dst);
        let src = pool.masked(pair.src);
        let ip_context = &mut conn.context.ip_context;
        ip_context.dst_ip_addrs = vec![dst.clone()];
        ip_context.src_ip_addrs = vec![src.clone()];
        ip_context.dst_routes = vec![Route::new(src)];
        ip_context.src_routes = vec![Route::new(dst)];
    }
}

#[async_trait]
impl NetworkServiceStep for P2pIpamStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let excludes = request
            .connection
            .context
            .ip_context
            .excluded_prefixes
            .clone();

        let pair = match self.connections.get(&id).map(|p| p.clone()) {
            Some(existing) if Self::pair_permitted(&existing, &excludes) => existing,
            Some(stale) => {
                // The exclude set moved under us; hand the pair back and
                // start over.
                self.release(&stale);
                self.connections.remove(&id);
                let fresh = self.allocate(&excludes)?;
                self.connections.insert(id.clone(), fresh.clone());
                fresh
            }
            None => {
                let fresh = self.allocate(&excludes)?;
                self.connections.insert(id.clone(), fresh.clone());
                fresh
            }
        };

        self.write_ip_context(&mut request.connection, &pair);

        match next.request(ctx, request).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.release(&pair);
                self.connections.remove(&id);
                Err(err)
            }
        }
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        if let Some((_, pair)) = self.connections.remove(&conn.id) {
            self.release(&pair);
        }
        next.close(ctx, conn).await
    }
}
