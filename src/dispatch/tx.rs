//! Outbound handler chain: L3 assembly, IPv6 fragmentation, neighbor
//! gating, and frame enqueue, with the per-datagram outcome taxonomy.

use super::Dispatcher;
use crate::logger::{self, BreadcrumbFlags};
use crate::neighbor::{next_hop, Lookup, NextHop};
use crate::proto::arp::ArpAssembler;
use crate::proto::ether::{EtherAssembler, MacAddr, ETHER_TYPE_ARP, ETHER_TYPE_IP4, ETHER_TYPE_IP6};
use crate::proto::icmp6::{Icmp6Assembler, Icmp6Message};
use crate::proto::ip4::Ip4Assembler;
use crate::proto::ip6::{Ip6Assembler, IP6_HEADER_LEN};
use crate::proto::ip6_frag::{Ip6FragAssembler, IP6_FRAG_HEADER_LEN};
use crate::proto::Assembler;
use crate::tx_ring::FrameTx;
use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

/// Result of one transmit attempt, ordered most-severe first. The outcome
/// of a fragmented datagram is the most severe member of its per-fragment
/// outcome set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOutcome {
    DroppedEtherResolutionFail,
    DroppedEtherNoGateway,
    DroppedEtherCacheFail,
    DroppedEtherGatewayCacheFail,
    PassedToTxRing,
    DroppedIp4InvalidSource,
    DroppedIp6InvalidSource,
    DroppedIp6FragBuild,
    DroppedIp6FragUnknown,
    DroppedTxRingFull,
}

impl TxOutcome {
    /// Severity scan order for multi-fragment aggregation.
    const SEVERITY: [TxOutcome; 5] = [
        TxOutcome::DroppedEtherResolutionFail,
        TxOutcome::DroppedEtherNoGateway,
        TxOutcome::DroppedEtherCacheFail,
        TxOutcome::DroppedEtherGatewayCacheFail,
        TxOutcome::PassedToTxRing,
    ];

    /// Reduce a per-fragment outcome set to the most severe member.
    pub fn most_severe(outcomes: &[TxOutcome]) -> TxOutcome {
        for candidate in Self::SEVERITY {
            if outcomes.contains(&candidate) {
                return candidate;
            }
        }
        TxOutcome::DroppedIp6FragUnknown
    }

    pub fn is_passed(self) -> bool {
        self == TxOutcome::PassedToTxRing
    }
}

/// Destination selection for the Ethernet layer.
pub(super) enum EtherDst {
    /// Link-layer address already known (broadcast, multicast, replies).
    Mac(MacAddr),
    /// Resolve the L2 address from the L3 destination.
    Resolve(IpAddr),
}

impl Dispatcher {
    /// Send one IPv4 datagram carrying `carried`.
    pub fn tx_ip4(&mut self, src: Ipv4Addr, dst: Ipv4Addr, carried: Box<dyn Assembler>) -> TxOutcome {
        if !src.is_unspecified() && !self.config.is_local_ip4(src) {
            self.counters.tx_dropped = self.counters.tx_dropped.saturating_add(1);
            return TxOutcome::DroppedIp4InvalidSource;
        }
        self.ip4_id = self.ip4_id.wrapping_add(1);
        let packet = Ip4Assembler::new(src, dst, carried).with_id(self.ip4_id);
        logger::breadcrumb(
            BreadcrumbFlags::IP4,
            format!("{} - IPv4 {src} -> {dst}, dlen {}", packet.tracker(), packet.dlen()),
        );
        let ether_dst = if dst.is_broadcast() || self.is_directed_broadcast(dst) {
            EtherDst::Mac(MacAddr::BROADCAST)
        } else if dst.is_multicast() {
            EtherDst::Mac(MacAddr::from_ip4_multicast(dst))
        } else {
            EtherDst::Resolve(IpAddr::V4(dst))
        };
        self.tx_ether(ETHER_TYPE_IP4, Box::new(packet), ether_dst)
    }

    /// Send one IPv6 datagram, fragmenting when the carried payload does
    /// not fit the link MTU.
    pub fn tx_ip6(&mut self, src: Ipv6Addr, dst: Ipv6Addr, carried: Box<dyn Assembler>) -> TxOutcome {
        if !src.is_unspecified() && !self.config.is_local_ip6(src) {
            self.counters.tx_dropped = self.counters.tx_dropped.saturating_add(1);
            return TxOutcome::DroppedIp6InvalidSource;
        }
        if carried.len() > self.config.tap_mtu - IP6_HEADER_LEN {
            return self.tx_ip6_frag(src, dst, carried);
        }
        let packet = Ip6Assembler::new(src, dst, carried);
        logger::breadcrumb(
            BreadcrumbFlags::IP6,
            format!("{} - IPv6 {src} -> {dst}, dlen {}", packet.tracker(), packet.dlen()),
        );
        let ether_dst = if dst.is_multicast() {
            EtherDst::Mac(MacAddr::from_ip6_multicast(dst))
        } else {
            EtherDst::Resolve(IpAddr::V6(dst))
        };
        self.tx_ether(ETHER_TYPE_IP6, Box::new(packet), ether_dst)
    }

    /// Split an oversize carried payload into a fragment-header chain.
    fn tx_ip6_frag(
        &mut self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        carried: Box<dyn Assembler>,
    ) -> TxOutcome {
        let data_mtu = (self.config.tap_mtu - IP6_HEADER_LEN - IP6_FRAG_HEADER_LEN) & !7;
        // The only time a complete pre-fragment payload exists in memory:
        // the carried packet assembles against the original pseudo-header.
        let pshdr_sum = carried.pshdr_sum(IpAddr::V6(src), IpAddr::V6(dst));
        let mut data = vec![0u8; carried.len()];
        carried.assemble(&mut data, pshdr_sum);

        self.ip6_id = self.ip6_id.wrapping_add(1);
        let id = self.ip6_id;
        let next = carried.proto();
        let parent = carried.tracker().clone();

        let mut outcomes: SmallVec<[TxOutcome; 8]> = SmallVec::new();
        for (offset, end, more) in split_spans(data.len(), data_mtu) {
            let fragment = match Ip6FragAssembler::new(
                next,
                offset,
                more,
                id,
                data[offset..end].to_vec(),
                &parent,
            ) {
                Ok(fragment) => fragment,
                Err(error) => {
                    logger::warn(format!("fragment build failed at offset {offset}: {error}"));
                    outcomes.push(TxOutcome::DroppedIp6FragBuild);
                    break;
                }
            };
            logger::breadcrumb(
                BreadcrumbFlags::FRAG,
                format!(
                    "{} - fragment id {id:#010x} offset {offset} len {} more {more}",
                    fragment.tracker(),
                    end - offset,
                ),
            );
            outcomes.push(self.tx_ip6(src, dst, Box::new(fragment)));
        }
        TxOutcome::most_severe(&outcomes)
    }

    /// Final TX stage: pick the destination MAC, assemble the frame, hand
    /// it to the TX ring.
    pub(super) fn tx_ether(
        &mut self,
        ether_type: u16,
        carried: Box<dyn Assembler>,
        dst: EtherDst,
    ) -> TxOutcome {
        let dst_mac = match dst {
            EtherDst::Mac(mac) => mac,
            EtherDst::Resolve(addr) => match self.resolve_dst(addr) {
                Ok(mac) => mac,
                Err(outcome) => {
                    self.counters.tx_dropped = self.counters.tx_dropped.saturating_add(1);
                    return outcome;
                }
            },
        };
        let frame_tx = EtherAssembler::new(self.config.mac_addr, dst_mac, ether_type, carried);
        let mut frame = vec![0u8; frame_tx.len()];
        frame_tx.assemble(&mut frame, 0);
        logger::breadcrumb(
            BreadcrumbFlags::ETHER,
            format!(
                "{} - ether {} -> {}, type {ether_type:#06x}",
                frame_tx.tracker(),
                self.config.mac_addr,
                dst_mac
            ),
        );
        match self.tx_ring.enqueue(FrameTx {
            frame,
            tracker: frame_tx.tracker().clone(),
        }) {
            Ok(()) => {
                self.counters.tx_passed = self.counters.tx_passed.saturating_add(1);
                TxOutcome::PassedToTxRing
            }
            Err(_) => {
                self.counters.tx_dropped = self.counters.tx_dropped.saturating_add(1);
                TxOutcome::DroppedTxRingFull
            }
        }
    }

    /// Gate a unicast transmit on the neighbor cache; a miss triggers
    /// resolution and drops the frame.
    fn resolve_dst(&mut self, dst: IpAddr) -> Result<MacAddr, TxOutcome> {
        let (target, via_gateway) = match next_hop(&self.config, dst) {
            NextHop::OnLink(target) => (target, false),
            NextHop::Gateway(target) => (target, true),
            NextHop::NoGateway => return Err(TxOutcome::DroppedEtherNoGateway),
        };
        match self.neighbors.lookup(target, Instant::now()) {
            Lookup::Hit(mac) => Ok(mac),
            Lookup::Negative => Err(TxOutcome::DroppedEtherResolutionFail),
            Lookup::Miss => {
                self.solicit(target);
                Err(if via_gateway {
                    TxOutcome::DroppedEtherGatewayCacheFail
                } else {
                    TxOutcome::DroppedEtherCacheFail
                })
            }
        }
    }

    /// Send an ARP request or ND solicitation for `target`.
    fn solicit(&mut self, target: IpAddr) {
        match target {
            IpAddr::V4(target) => {
                let Some(host) = self.config.ip4_host.first().copied() else {
                    return;
                };
                logger::breadcrumb(
                    BreadcrumbFlags::ARP,
                    format!("soliciting {target} via ARP request"),
                );
                let request = ArpAssembler::request(self.config.mac_addr, host.addr, target);
                self.tx_ether(
                    ETHER_TYPE_ARP,
                    Box::new(request),
                    EtherDst::Mac(MacAddr::BROADCAST),
                );
            }
            IpAddr::V6(target) => {
                let Some(host) = self.config.ip6_host.first().copied() else {
                    return;
                };
                logger::breadcrumb(
                    BreadcrumbFlags::ND,
                    format!("soliciting {target} via neighbor solicitation"),
                );
                let solicitation = match Icmp6Assembler::new(
                    Icmp6Message::NeighborSolicitation {
                        target,
                        source_ll: Some(self.config.mac_addr),
                    },
                    None,
                ) {
                    Ok(solicitation) => solicitation,
                    Err(_) => return,
                };
                let group = crate::proto::ip6::solicited_node(target);
                let packet =
                    Ip6Assembler::new(host.addr, group, Box::new(solicitation)).with_hop(255);
                self.tx_ether(
                    ETHER_TYPE_IP6,
                    Box::new(packet),
                    EtherDst::Mac(MacAddr::from_ip6_multicast(group)),
                );
            }
        }
    }

    fn is_directed_broadcast(&self, dst: Ipv4Addr) -> bool {
        self.config
            .ip4_host
            .iter()
            .any(|host| host.broadcast() == dst)
    }
}

/// Partition `total` payload bytes into consecutive `(offset, end, more)`
/// spans of at most `data_mtu` bytes. `data_mtu` is already rounded down
/// to a multiple of 8, so every non-final span keeps fragment alignment.
pub(super) fn split_spans(total: usize, data_mtu: usize) -> SmallVec<[(usize, usize, bool); 8]> {
    let mut spans = SmallVec::new();
    let mut offset = 0;
    while offset < total {
        let end = (offset + data_mtu).min(total);
        spans.push((offset, end, end < total));
        offset = end;
    }
    spans
}
