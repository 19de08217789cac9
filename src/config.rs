//! Stack configuration: interface addressing, MTU, ring and reassembly
//! limits. Defaults match a plain 1500-byte Ethernet tap; every limit can
//! be overridden from the process environment with its upper-snake name.

use crate::proto::ether::MacAddr;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 9000;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_RING_CAPACITY: usize = 512;
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REASSEMBLY_MAX_ENTRIES: usize = 256;
pub const DEFAULT_REASSEMBLY_MAX_BYTES: usize = 1024 * 1024;

/// IPv4 interface address with its on-link prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip4Host {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ip4Host {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn contains(&self, other: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix_len.min(32) as u32);
        (u32::from(self.addr) & mask) == (u32::from(other) & mask)
    }

    /// Directed broadcast address of the on-link subnet.
    pub fn broadcast(&self) -> Ipv4Addr {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len.min(32) as u32)
        };
        Ipv4Addr::from(u32::from(self.addr) | !mask)
    }
}

/// IPv6 interface address with its on-link prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip6Host {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
}

impl Ip6Host {
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn contains(&self, other: Ipv6Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let bits = self.prefix_len.min(128) as u32;
        let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
        (u128::from(self.addr) & mask) == (u128::from(other) & mask)
    }

    /// Solicited-node multicast group for this address.
    pub fn solicited_node(&self) -> Ipv6Addr {
        crate::proto::ip6::solicited_node(self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub tap_mtu: usize,
    pub mac_addr: MacAddr,
    pub ip4_host: Vec<Ip4Host>,
    pub ip4_gateway: Option<Ipv4Addr>,
    pub ip6_host: Vec<Ip6Host>,
    pub ip6_gateway: Option<Ipv6Addr>,
    pub rx_ring_capacity: usize,
    pub tx_ring_capacity: usize,
    pub ip6_reassembly_timeout: Duration,
    pub ip6_reassembly_max_entries: usize,
    pub ip6_reassembly_max_bytes: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tap_mtu: DEFAULT_MTU,
            mac_addr: MacAddr([0x02, 0x00, 0x00, 0x77, 0x77, 0x77]),
            ip4_host: Vec::new(),
            ip4_gateway: None,
            ip6_host: Vec::new(),
            ip6_gateway: None,
            rx_ring_capacity: DEFAULT_RING_CAPACITY,
            tx_ring_capacity: DEFAULT_RING_CAPACITY,
            ip6_reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            ip6_reassembly_max_entries: DEFAULT_REASSEMBLY_MAX_ENTRIES,
            ip6_reassembly_max_bytes: DEFAULT_REASSEMBLY_MAX_BYTES,
        }
    }
}

impl StackConfig {
    /// Defaults overridden by any recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(mtu) = env_usize("TAP_MTU") {
            config.tap_mtu = mtu;
        }
        if let Some(ms) = env_usize("IP6_REASSEMBLY_TIMEOUT_MS") {
            config.ip6_reassembly_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(entries) = env_usize("IP6_REASSEMBLY_MAX_ENTRIES") {
            config.ip6_reassembly_max_entries = entries;
        }
        if let Some(bytes) = env_usize("IP6_REASSEMBLY_MAX_BYTES") {
            config.ip6_reassembly_max_bytes = bytes;
        }
        if let Some(capacity) = env_usize("RX_RING_CAPACITY") {
            config.rx_ring_capacity = capacity;
        }
        if let Some(capacity) = env_usize("TX_RING_CAPACITY") {
            config.tx_ring_capacity = capacity;
        }
        config.normalize();
        config
    }

    /// Clamp values into workable ranges.
    pub fn normalize(&mut self) {
        self.tap_mtu = self.tap_mtu.clamp(MIN_MTU, MAX_MTU);
        self.rx_ring_capacity = self.rx_ring_capacity.max(16);
        self.tx_ring_capacity = self.tx_ring_capacity.max(16);
        self.ip6_reassembly_max_entries = self.ip6_reassembly_max_entries.max(1);
    }

    pub fn is_local_ip4(&self, addr: Ipv4Addr) -> bool {
        self.ip4_host.iter().any(|host| host.addr == addr)
    }

    pub fn is_local_ip6(&self, addr: Ipv6Addr) -> bool {
        self.ip6_host.iter().any(|host| host.addr == addr)
    }

    pub fn is_on_link_ip4(&self, addr: Ipv4Addr) -> bool {
        self.ip4_host.iter().any(|host| host.contains(addr))
    }

    pub fn is_on_link_ip6(&self, addr: Ipv6Addr) -> bool {
        self.ip6_host.iter().any(|host| host.contains(addr))
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_containment_ip4() {
        let host = Ip4Host::new(Ipv4Addr::new(192, 168, 9, 7), 24);
        assert!(host.contains(Ipv4Addr::new(192, 168, 9, 200)));
        assert!(!host.contains(Ipv4Addr::new(192, 168, 10, 1)));
        assert_eq!(host.broadcast(), Ipv4Addr::new(192, 168, 9, 255));
    }

    #[test]
    fn prefix_containment_ip6() {
        let host = Ip6Host::new("2001:db8::7".parse().unwrap(), 64);
        assert!(host.contains("2001:db8::99".parse().unwrap()));
        assert!(!host.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn solicited_node_group() {
        let host = Ip6Host::new("2001:db8::1:800:200e:8c6c".parse().unwrap(), 64);
        assert_eq!(
            host.solicited_node(),
            "ff02::1:ff0e:8c6c".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn normalize_clamps_mtu() {
        let mut config = StackConfig {
            tap_mtu: 100,
            ..Default::default()
        };
        config.normalize();
        assert_eq!(config.tap_mtu, 576);
    }
}
