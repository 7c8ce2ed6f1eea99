//! vL3 pool allocator: single-address allocation out of one prefix with an
//! explicit exclude list.
//!
//! Every address is in exactly one of three buckets: free, excluded or
//! allocated. Hole-filling is inherited from the ordered free pool: the
//! lowest freed address is the next one handed out.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::status::{Result, Status};

use super::ippool::{ip_of, key_of, IpPool};

struct Buckets {
    free: IpPool,
    excluded: IpPool,
    allocated: BTreeSet<u128>,
}

pub struct Vl3Pool {
    prefix: IpNet,
    buckets: Mutex<Buckets>,
}

impl Vl3Pool {
    pub fn new(prefix: IpNet, excludes: impl IntoIterator<Item = IpNet>) -> Self {
        let mut free = IpPool::from_net(prefix);
        let mut excluded = IpPool::new();
        for net in excludes {
            free.exclude_net(net);
            // Only the part of the exclude inside the prefix counts.
            let mut slice = IpPool::from_net(net);
            let mut outside = IpPool::from_net(net);
            outside.exclude_net(prefix);
            for (start, end) in outside.ranges().collect::<Vec<_>>() {
                slice.remove_range(start, end);
            }
            for (start, end) in slice.ranges().collect::<Vec<_>>() {
                excluded.add_range(start, end);
            }
        }
        Self {
            prefix,
            buckets: Mutex::new(Buckets {
                free,
                excluded,
                allocated: BTreeSet::new(),
            }),
        }
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    fn v4(&self) -> bool {
        matches!(self.prefix, IpNet::V4(_))
    }

    /// Lowest free address.
    pub fn allocate(&self) -> Result<IpAddr> {
        let mut buckets = self.buckets.lock();
        let key = buckets
            .free
            .pull()
            .ok_or_else(|| Status::resource_exhausted(format!("pool {} is empty", self.prefix)))?;
        buckets.allocated.insert(key);
        Ok(ip_of(key, self.v4()))
    }

    /// A specific address; fails when it is excluded, outside the prefix or
    /// already allocated.
    pub fn allocate_specific(&self, ip: IpAddr) -> Result<IpAddr> {
        let key = key_of(ip);
        let mut buckets = self.buckets.lock();
        if buckets.excluded.contains_key(key) {
            return Err(Status::failed_precondition(format!("{ip} is excluded")));
        }
        if buckets.allocated.contains(&key) {
            return Err(Status::already_exists(format!("{ip} is already allocated")));
        }
        if !buckets.free.pull_key(key) {
            return Err(Status::invalid_argument(format!(
                "{ip} is outside of pool {}",
                self.prefix
            )));
        }
        buckets.allocated.insert(key);
        Ok(ip)
    }

    pub fn free_if_allocated(&self, ip: IpAddr) {
        let key = key_of(ip);
        let mut buckets = self.buckets.lock();
        if buckets.allocated.remove(&key) {
            buckets.free.add_range(key, key);
        }
    }

    pub fn free_list(&self, ips: impl IntoIterator<Item = IpAddr>) {
        for ip in ips {
            self.free_if_allocated(ip);
        }
    }

    pub fn is_excluded(&self, ip: IpAddr) -> bool {
        self.buckets.lock().excluded.contains(ip)
    }

    pub fn is_allocated(&self, ip: IpAddr) -> bool {
        self.buckets.lock().allocated.contains(&key_of(ip))
    }

    /// (free, excluded, allocated) sizes; their sum is the pool size.
    pub fn census(&self) -> (u128, u128, u128) {
        let buckets = self.buckets.lock();
        (
            buckets.free.size(),
            buckets.excluded.size(),
            buckets.allocated.len() as u128,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vl3Pool {
        Vl3Pool::new(
            "10.5.0.0/24".parse().unwrap(),
            ["10.5.0.0/30".parse().unwrap()],
        )
    }

    #[test]
    fn allocates_lowest_outside_excludes() {
        let pool = pool();
        assert_eq!(pool.allocate().unwrap().to_string(), "10.5.0.4");
        assert_eq!(pool.allocate().unwrap().to_string(), "10.5.0.5");
    }

    #[test]
    fn conservation_across_buckets() {
        let pool = pool();
        let (free, excluded, allocated) = pool.census();
        assert_eq!(free + excluded + allocated, 256);

        let ip = pool.allocate().unwrap();
        let (free2, excluded2, allocated2) = pool.census();
        assert_eq!(free2 + excluded2 + allocated2, 256);
        assert_eq!(allocated2, 1);
        assert_eq!(excluded2, excluded);

        pool.free_if_allocated(ip);
        let (free3, _, allocated3) = pool.census();
        assert_eq!(allocated3, 0);
        assert_eq!(free3, free);
    }

    #[test]
    fn allocate_specific_twice_fails() {
        let pool = pool();
        let ip: IpAddr = "10.5.0.33".parse().unwrap();
        pool.allocate_specific(ip).unwrap();
        let err = pool.allocate_specific(ip).unwrap_err();
        assert!(matches!(err, Status::AlreadyExists(_)));
    }

    #[test]
    fn excluded_addresses_cannot_be_allocated() {
        let pool = pool();
        let ip: IpAddr = "10.5.0.2".parse().unwrap();
        assert!(pool.is_excluded(ip));
        let err = pool.allocate_specific(ip).unwrap_err();
        assert!(matches!(err, Status::FailedPrecondition(_)));
    }

    #[test]
    fn free_if_allocated_is_a_noop_on_free_addresses() {
        let pool = pool();
        let (free, _, _) = pool.census();
        pool.free_if_allocated("10.5.0.100".parse().unwrap());
        let (free2, _, _) = pool.census();
        assert_eq!(free, free2);
    }

    #[test]
    fn hole_filling_reuses_the_lowest_freed_address() {
        let pool = pool();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.free_if_allocated(a);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn free_list_releases_everything() {
        let pool = pool();
        let ips: Vec<IpAddr> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        pool.free_list(ips.clone());
        for ip in ips {
            assert!(!pool.is_allocated(ip));
        }
    }
}
