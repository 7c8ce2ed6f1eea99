//! Ordered set of free addresses, kept as merged inclusive ranges.
//!
//! Addresses are mapped to `u128` keys (IPv4 in the low 32 bits) so one
//! structure serves both families. Pulling always returns the lowest free
//! address, which is what makes allocation deterministic after releases.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;

pub fn key_of(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub fn ip_of(key: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(std::net::Ipv4Addr::from(key as u32))
    } else {
        IpAddr::V6(std::net::Ipv6Addr::from(key))
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpPool {
    /// start → end, inclusive, non-overlapping, non-adjacent.
    ranges: BTreeMap<u128, u128>,
}

impl IpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool over the whole network, network and broadcast addresses included.
    pub fn from_net(net: IpNet) -> Self {
        let mut pool = Self::new();
        pool.add_net(net);
        pool
    }

    pub fn add_net(&mut self, net: IpNet) {
        self.add_range(key_of(net.network()), key_of(net.broadcast()));
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        let key = key_of(ip);
        self.add_range(key, key);
    }

    pub fn add_range(&mut self, mut start: u128, mut end: u128) {
        debug_assert!(start <= end);
        let absorbed: Vec<u128> = self
            .ranges
            .range(..=end.saturating_add(1))
            .filter(|(_, &e)| e.checked_add(1).map_or(true, |e1| e1 >= start))
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            let e = self.ranges.remove(&s).unwrap();
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    pub fn exclude_net(&mut self, net: IpNet) {
        self.remove_range(key_of(net.network()), key_of(net.broadcast()));
    }

    pub fn remove_ip(&mut self, ip: IpAddr) {
        let key = key_of(ip);
        self.remove_range(key, key);
    }

    pub fn remove_range(&mut self, start: u128, end: u128) {
        let affected: Vec<(u128, u128)> = self
            .ranges
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in affected {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start - 1);
            }
            if e > end {
                self.ranges.insert(end + 1, e);
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.contains_key(key_of(ip))
    }

    pub fn contains_key(&self, key: u128) -> bool {
        self.ranges
            .range(..=key)
            .next_back()
            .is_some_and(|(_, &e)| e >= key)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The merged ranges, in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = (u128, u128)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Number of addresses in the pool.
    pub fn size(&self) -> u128 {
        self.ranges
            .iter()
            .map(|(&s, &e)| e - s + 1)
            .fold(0u128, u128::saturating_add)
    }

    /// Removes and returns the lowest free address key.
    pub fn pull(&mut self) -> Option<u128> {
        let (&start, &end) = self.ranges.iter().next()?;
        self.ranges.remove(&start);
        if start < end {
            self.ranges.insert(start + 1, end);
        }
        Some(start)
    }

    /// Removes a specific address; false when it is not free.
    pub fn pull_key(&mut self, key: u128) -> bool {
        if !self.contains_key(key) {
            return false;
        }
        self.remove_range(key, key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn pull_returns_lowest_first() {
        let mut pool = IpPool::from_net(net("192.168.1.0/30"));
        assert_eq!(ip_of(pool.pull().unwrap(), true).to_string(), "192.168.1.0");
        assert_eq!(ip_of(pool.pull().unwrap(), true).to_string(), "192.168.1.1");
    }

    #[test]
    fn excluded_addresses_are_skipped() {
        let mut pool = IpPool::from_net(net("192.168.1.0/29"));
        pool.exclude_net(net("192.168.1.1/32"));
        pool.exclude_net(net("192.168.1.2/31"));
        assert_eq!(ip_of(pool.pull().unwrap(), true).to_string(), "192.168.1.0");
        assert_eq!(ip_of(pool.pull().unwrap(), true).to_string(), "192.168.1.4");
    }

    #[test]
    fn released_addresses_merge_back() {
        let mut pool = IpPool::from_net(net("10.0.0.0/30"));
        let a = pool.pull().unwrap();
        let b = pool.pull().unwrap();
        pool.add_range(a, a);
        pool.add_range(b, b);
        // Lowest address is available again.
        assert_eq!(pool.pull().unwrap(), a);
    }

    #[test]
    fn size_and_contains_track_membership() {
        let mut pool = IpPool::from_net(net("10.0.0.0/24"));
        assert_eq!(pool.size(), 256);
        assert!(pool.contains("10.0.0.42".parse().unwrap()));
        pool.remove_ip("10.0.0.42".parse().unwrap());
        assert!(!pool.contains("10.0.0.42".parse().unwrap()));
        assert_eq!(pool.size(), 255);
    }

    #[test]
    fn ipv6_pools_use_the_full_width() {
        let mut pool = IpPool::from_net(net("fe80::/126"));
        assert_eq!(ip_of(pool.pull().unwrap(), false).to_string(), "fe80::");
        assert_eq!(ip_of(pool.pull().unwrap(), false).to_string(), "fe80::1");
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut pool = IpPool::new();
        pool.add_range(10, 20);
        pool.add_range(21, 30);
        assert_eq!(pool.size(), 21);
        pool.remove_range(15, 25);
        assert_eq!(pool.size(), 10);
        assert!(pool.contains(ip_of(14, true)));
        assert!(!pool.contains(ip_of(15, true)));
        assert!(pool.contains(ip_of(26, true)));
    }
}
