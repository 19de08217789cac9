//! Neighbor resolution gate: next-hop selection and the ARP/ND cache that
//! L3 transmission is gated on. Owned by the dispatcher thread; nothing
//! here is shared across threads.

use crate::config::StackConfig;
use crate::logger::{self, BreadcrumbFlags};
use crate::proto::ether::MacAddr;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How long an unanswered solicitation stays pending before the address is
/// negatively cached.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a negative entry suppresses re-resolution.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// Where a datagram leaves the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Destination is on-link; resolve the destination itself.
    OnLink(IpAddr),
    /// Destination is off-link; resolve the configured gateway.
    Gateway(IpAddr),
    /// Off-link with no gateway configured for the family.
    NoGateway,
}

pub fn next_hop(config: &StackConfig, dst: IpAddr) -> NextHop {
    match dst {
        IpAddr::V4(dst) => {
            if config.is_on_link_ip4(dst) {
                NextHop::OnLink(IpAddr::V4(dst))
            } else {
                match config.ip4_gateway {
                    Some(gateway) => NextHop::Gateway(IpAddr::V4(gateway)),
                    None => NextHop::NoGateway,
                }
            }
        }
        IpAddr::V6(dst) => {
            if config.is_on_link_ip6(dst) {
                NextHop::OnLink(IpAddr::V6(dst))
            } else {
                match config.ip6_gateway {
                    Some(gateway) => NextHop::Gateway(IpAddr::V6(gateway)),
                    None => NextHop::NoGateway,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NeighborEntry {
    Reachable(MacAddr),
    /// Solicitation sent, no answer yet.
    Pending(Instant),
    /// Resolution failed; suppressed until the TTL runs out.
    Negative(Instant),
}

/// Outcome of one cache consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(MacAddr),
    /// Unknown or still pending; the caller should (re)solicit and drop.
    Miss,
    /// Negatively cached; the caller drops without soliciting.
    Negative,
}

#[derive(Default)]
pub struct NeighborCache {
    entries: FxHashMap<IpAddr, NeighborEntry>,
}

impl NeighborCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult the cache for `addr`. A miss registers a pending entry so
    /// the sweep can later turn silence into a negative entry.
    pub fn lookup(&mut self, addr: IpAddr, now: Instant) -> Lookup {
        match self.entries.get(&addr) {
            Some(NeighborEntry::Reachable(mac)) => Lookup::Hit(*mac),
            Some(NeighborEntry::Negative(_)) => Lookup::Negative,
            Some(NeighborEntry::Pending(_)) => Lookup::Miss,
            None => {
                self.entries.insert(addr, NeighborEntry::Pending(now));
                Lookup::Miss
            }
        }
    }

    /// Record a learned mapping (ARP reply/request source, ND
    /// advertisement target).
    pub fn learn(&mut self, addr: IpAddr, mac: MacAddr) {
        let previous = self.entries.insert(addr, NeighborEntry::Reachable(mac));
        if !matches!(previous, Some(NeighborEntry::Reachable(old)) if old == mac) {
            logger::breadcrumb(
                BreadcrumbFlags::ND,
                format!("neighbor {addr} is at {mac}"),
            );
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        matches!(self.entries.get(addr), Some(NeighborEntry::Reachable(_)))
    }

    #[cfg(test)]
    pub(crate) fn force_negative(&mut self, addr: IpAddr, now: Instant) {
        self.entries.insert(addr, NeighborEntry::Negative(now));
    }

    #[cfg(test)]
    pub(crate) fn forget(&mut self, addr: &IpAddr) {
        self.entries.remove(addr);
    }

    /// Age pending entries into negative ones and expire stale negatives.
    /// Invoked from the dispatcher between dequeues.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|addr, entry| match entry {
            NeighborEntry::Reachable(_) => true,
            NeighborEntry::Pending(since) => {
                if now.saturating_duration_since(*since) >= RESOLUTION_TIMEOUT {
                    logger::breadcrumb(
                        BreadcrumbFlags::ND,
                        format!("neighbor {addr} unresolved, negative-caching"),
                    );
                    *entry = NeighborEntry::Negative(now);
                }
                true
            }
            NeighborEntry::Negative(since) => {
                now.saturating_duration_since(*since) < NEGATIVE_TTL
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Ip4Host, StackConfig};
    use std::net::Ipv4Addr;

    fn config_with_gateway() -> StackConfig {
        StackConfig {
            ip4_host: vec![Ip4Host::new(Ipv4Addr::new(192, 168, 9, 7), 24)],
            ip4_gateway: Some(Ipv4Addr::new(192, 168, 9, 1)),
            ..Default::default()
        }
    }

    #[test]
    fn next_hop_prefers_on_link() {
        let config = config_with_gateway();
        let on_link = IpAddr::V4(Ipv4Addr::new(192, 168, 9, 20));
        assert_eq!(next_hop(&config, on_link), NextHop::OnLink(on_link));
        let off_link = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(
            next_hop(&config, off_link),
            NextHop::Gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 9, 1)))
        );
    }

    #[test]
    fn next_hop_without_gateway() {
        let mut config = config_with_gateway();
        config.ip4_gateway = None;
        let off_link = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(next_hop(&config, off_link), NextHop::NoGateway);
    }

    #[test]
    fn miss_then_learn_then_hit() {
        let mut cache = NeighborCache::new();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 9, 20));
        let now = Instant::now();
        assert_eq!(cache.lookup(addr, now), Lookup::Miss);
        cache.learn(addr, MacAddr([2, 0, 0, 0, 0, 0x14]));
        assert_eq!(
            cache.lookup(addr, now),
            Lookup::Hit(MacAddr([2, 0, 0, 0, 0, 0x14]))
        );
    }

    #[test]
    fn unanswered_pending_goes_negative_then_expires() {
        let mut cache = NeighborCache::new();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 9, 21));
        let start = Instant::now();
        assert_eq!(cache.lookup(addr, start), Lookup::Miss);
        cache.sweep(start + RESOLUTION_TIMEOUT);
        assert_eq!(cache.lookup(addr, start), Lookup::Negative);
        cache.sweep(start + RESOLUTION_TIMEOUT + NEGATIVE_TTL);
        // Expired negative entry allows a fresh resolution attempt.
        assert_eq!(cache.lookup(addr, start), Lookup::Miss);
    }
}
