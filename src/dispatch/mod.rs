//! Per-layer packet handlers. One handler parses one header, decides
//! local delivery versus forward-up, and invokes the next handler; the
//! transmit side is symmetric and lives in `tx`.

mod reassembly;
mod tx;


pub use reassembly::{FragKey, FragPush, ReassemblyTable, ReassemblyTimeout};
pub use tx::TxOutcome;

use crate::config::StackConfig;
use crate::frame::{LayerMark, PacketRx};
use crate::logger::{self, BreadcrumbFlags};
use crate::proto::arp::{ArpAssembler, ARP_OP_REPLY, ARP_OP_REQUEST};
use crate::proto::ether::{ETHER_TYPE_ARP, ETHER_TYPE_IP4, ETHER_TYPE_IP6};
use crate::proto::icmp4::{Icmp4Assembler, Icmp4Message, Icmp4View};
use crate::proto::icmp6::{
    Icmp6Assembler, Icmp6Message, Icmp6View, ICMP6_TIME_EXCEEDED_REASSEMBLY,
};
use crate::proto::ip6::IP6_HEADER_LEN;
use crate::proto::{
    self, arp, ether, icmp4, icmp6, ip4, ip6, ip6_frag, pseudo_header_sum, tcp, udp,
};
use crate::tracker::Tracker;
use crate::tx_ring::TxRing;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cadence of the timer sweep run between ring dequeues.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Most original-datagram bytes quoted in a reassembly-timeout report
/// (minimum IPv6 MTU minus the v6 and ICMPv6 headers).
const TIME_EXCEEDED_QUOTE_CAP: usize = 1280 - IP6_HEADER_LEN - 8;

/// Depth of the upward delivery channel toward the socket layer.
const DELIVERY_CHANNEL_DEPTH: usize = 1024;

/// One payload handed up to the socket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub l3_src: IpAddr,
    pub l3_dst: IpAddr,
    pub l4_proto: u8,
    pub sport: u16,
    pub dport: u16,
    pub payload: Vec<u8>,
    pub tracker: Tracker,
}

/// Saturating per-subsystem event counters, snapshot-copyable.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackCounters {
    pub rx_frames: u64,
    pub rx_addr_drops: u64,
    pub rx_parse_errors: u64,
    pub rx_proto_drops: u64,
    pub rx_ip4_frag_drops: u64,
    pub rx_delivered: u64,
    pub rx_delivery_overflow: u64,
    pub arp_replies: u64,
    pub echo_replies: u64,
    pub nd_advertisements: u64,
    pub reassembly_completed: u64,
    pub reassembly_poisoned: u64,
    pub reassembly_timeouts: u64,
    pub reassembly_limit_drops: u64,
    pub tx_passed: u64,
    pub tx_dropped: u64,
}

impl StackCounters {
    fn bump(field: &mut u64) {
        *field = field.saturating_add(1);
    }
}

pub struct Dispatcher {
    config: Arc<StackConfig>,
    tx_ring: Arc<TxRing>,
    neighbors: crate::neighbor::NeighborCache,
    reassembly: ReassemblyTable,
    delivery_tx: Sender<Delivery>,
    counters: StackCounters,
    /// Advanced once per fragmented datagram; single-thread access only.
    ip6_id: u32,
    ip4_id: u16,
    last_sweep: Instant,
}

impl Dispatcher {
    pub fn new(config: Arc<StackConfig>, tx_ring: Arc<TxRing>) -> (Self, Receiver<Delivery>) {
        let (delivery_tx, delivery_rx) = crossbeam_channel::bounded(DELIVERY_CHANNEL_DEPTH);
        let reassembly = ReassemblyTable::new(
            config.ip6_reassembly_timeout,
            config.ip6_reassembly_max_entries,
            config.ip6_reassembly_max_bytes,
        );
        let dispatcher = Self {
            config,
            tx_ring,
            neighbors: crate::neighbor::NeighborCache::new(),
            reassembly,
            delivery_tx,
            counters: StackCounters::default(),
            ip6_id: 0,
            ip4_id: 0,
            last_sweep: Instant::now(),
        };
        (dispatcher, delivery_rx)
    }

    pub fn counters(&self) -> StackCounters {
        self.counters
    }

    pub fn neighbors_mut(&mut self) -> &mut crate::neighbor::NeighborCache {
        &mut self.neighbors
    }

    /// Pre-fragmentation identification counter, visible for correlation.
    pub fn ip6_id(&self) -> u32 {
        self.ip6_id
    }

    /// Entry point for every frame the RX ring hands over.
    pub fn handle_frame(&mut self, mut packet: PacketRx) {
        StackCounters::bump(&mut self.counters.rx_frames);
        self.rx_ether(&mut packet);
    }

    /// Timer work run between ring dequeues: reassembly expiry and
    /// neighbor cache aging.
    pub fn on_tick(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        self.neighbors.sweep(now);
        let timeouts = self.reassembly.sweep(now);
        for event in timeouts {
            StackCounters::bump(&mut self.counters.reassembly_timeouts);
            self.report_reassembly_timeout(event);
        }
    }

    fn report_reassembly_timeout(&mut self, event: ReassemblyTimeout) {
        let Some(mut quote) = event.quote else {
            return;
        };
        let Some(host) = self.config.ip6_host.first().copied() else {
            return;
        };
        quote.truncate(TIME_EXCEEDED_QUOTE_CAP);
        let reply = match Icmp6Assembler::new(
            Icmp6Message::TimeExceeded {
                code: ICMP6_TIME_EXCEEDED_REASSEMBLY,
                data: quote,
            },
            Some(&event.tracker),
        ) {
            Ok(reply) => reply,
            Err(_) => return,
        };
        self.tx_ip6(host.addr, event.key.src, Box::new(reply));
    }

    fn rx_ether(&mut self, packet: &mut PacketRx) {
        let (dst, src, ether_type) = match ether::parse(packet.frame()) {
            Ok(view) => (view.dst, view.src, view.ether_type),
            Err(error) => {
                packet.marks.ether = LayerMark::malformed(0);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::ETHER,
                    format!("{} - dropped frame: {error}", packet.tracker()),
                );
                return;
            }
        };
        packet.marks.ether = LayerMark::ok(0);
        let local = dst == self.config.mac_addr || dst.is_broadcast() || dst.is_multicast();
        if !local {
            StackCounters::bump(&mut self.counters.rx_addr_drops);
            logger::breadcrumb(
                BreadcrumbFlags::ETHER,
                format!("{} - frame for {dst}, not local", packet.tracker()),
            );
            return;
        }
        logger::breadcrumb(
            BreadcrumbFlags::ETHER,
            format!("{} - ether {src} -> {dst}, type {ether_type:#06x}", packet.tracker()),
        );
        match ether_type {
            ETHER_TYPE_ARP => self.rx_arp(packet, ether::ETHER_HEADER_LEN),
            ETHER_TYPE_IP4 => self.rx_ip4(packet, ether::ETHER_HEADER_LEN),
            ETHER_TYPE_IP6 => self.rx_ip6(packet, ether::ETHER_HEADER_LEN, true),
            _ => {
                StackCounters::bump(&mut self.counters.rx_proto_drops);
            }
        }
    }

    fn rx_arp(&mut self, packet: &mut PacketRx, offset: usize) {
        let view = match arp::parse(&packet.frame()[offset..]) {
            Ok(view) => view,
            Err(error) => {
                packet.marks.l3 = LayerMark::malformed(offset);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::ARP,
                    format!("{} - dropped ARP: {error}", packet.tracker()),
                );
                return;
            }
        };
        packet.marks.l3 = LayerMark::ok(offset);
        if !view.spa.is_unspecified() {
            self.neighbors.learn(IpAddr::V4(view.spa), view.sha);
        }
        match view.oper {
            ARP_OP_REQUEST if self.config.is_local_ip4(view.tpa) => {
                logger::breadcrumb(
                    BreadcrumbFlags::ARP,
                    format!("{} - who-has {} from {}", packet.tracker(), view.tpa, view.spa),
                );
                let reply = match ArpAssembler::new(
                    ARP_OP_REPLY,
                    self.config.mac_addr,
                    view.tpa,
                    view.sha,
                    view.spa,
                    Some(packet.tracker()),
                ) {
                    Ok(reply) => reply,
                    Err(_) => return,
                };
                StackCounters::bump(&mut self.counters.arp_replies);
                self.tx_ether(ETHER_TYPE_ARP, Box::new(reply), tx::EtherDst::Mac(view.sha));
            }
            _ => {}
        }
    }

    fn rx_ip4(&mut self, packet: &mut PacketRx, offset: usize) {
        let (view_src, view_dst, l4_proto, frag, payload_range) =
            match ip4::parse(&packet.frame()[offset..]) {
                Ok(view) => {
                    let range = (offset + view.hlen, offset + view.total_len);
                    (
                        view.src,
                        view.dst,
                        view.proto,
                        view.flag_mf || view.frag_offset > 0,
                        range,
                    )
                }
                Err(error) => {
                    packet.marks.l3 = LayerMark::malformed(offset);
                    StackCounters::bump(&mut self.counters.rx_parse_errors);
                    logger::breadcrumb(
                        BreadcrumbFlags::IP4,
                        format!("{} - dropped IPv4: {error}", packet.tracker()),
                    );
                    return;
                }
            };
        packet.marks.l3 = LayerMark::ok(offset);
        if !self.is_local_dst_ip4(view_dst) {
            StackCounters::bump(&mut self.counters.rx_addr_drops);
            return;
        }
        if frag {
            // No IPv4 reassembly; fragments are dropped on arrival.
            StackCounters::bump(&mut self.counters.rx_ip4_frag_drops);
            logger::breadcrumb(
                BreadcrumbFlags::IP4,
                format!("{} - dropped IPv4 fragment from {view_src}", packet.tracker()),
            );
            return;
        }
        let src = IpAddr::V4(view_src);
        let dst = IpAddr::V4(view_dst);
        match l4_proto {
            proto::PROTO_ICMP4 => self.rx_icmp4(packet, payload_range, view_src, view_dst),
            proto::PROTO_UDP => self.rx_udp(packet, payload_range, src, dst, false),
            proto::PROTO_TCP => self.rx_tcp(packet, payload_range, src, dst),
            _ => {
                StackCounters::bump(&mut self.counters.rx_proto_drops);
            }
        }
    }

    fn rx_ip6(&mut self, packet: &mut PacketRx, offset: usize, allow_frag: bool) {
        let (view_src, view_dst, next, payload_range) = match ip6::parse(&packet.frame()[offset..])
        {
            Ok(view) => (
                view.src,
                view.dst,
                view.next,
                (offset + IP6_HEADER_LEN, offset + IP6_HEADER_LEN + view.dlen),
            ),
            Err(error) => {
                packet.marks.l3 = LayerMark::malformed(offset);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::IP6,
                    format!("{} - dropped IPv6: {error}", packet.tracker()),
                );
                return;
            }
        };
        packet.marks.l3 = LayerMark::ok(offset);
        if !self.is_local_dst_ip6(view_dst) {
            StackCounters::bump(&mut self.counters.rx_addr_drops);
            return;
        }
        let src = IpAddr::V6(view_src);
        let dst = IpAddr::V6(view_dst);
        match next {
            proto::PROTO_IP6_FRAG if allow_frag => {
                self.rx_ip6_frag(packet, payload_range, view_src, view_dst)
            }
            proto::PROTO_ICMP6 => self.rx_icmp6(packet, payload_range, view_src, view_dst),
            proto::PROTO_UDP => self.rx_udp(packet, payload_range, src, dst, true),
            proto::PROTO_TCP => self.rx_tcp(packet, payload_range, src, dst),
            _ => {
                StackCounters::bump(&mut self.counters.rx_proto_drops);
            }
        }
    }

    fn rx_ip6_frag(
        &mut self,
        packet: &mut PacketRx,
        (start, end): (usize, usize),
        src: Ipv6Addr,
        dst: Ipv6Addr,
    ) {
        let (next, frag_offset, more, id, payload_range) =
            match ip6_frag::parse(&packet.frame()[start..end]) {
                Ok(view) => (
                    view.next,
                    view.offset,
                    view.more,
                    view.id,
                    (start + ip6_frag::IP6_FRAG_HEADER_LEN, end),
                ),
                Err(error) => {
                    packet.marks.frag = LayerMark::malformed(start);
                    StackCounters::bump(&mut self.counters.rx_parse_errors);
                    logger::breadcrumb(
                        BreadcrumbFlags::FRAG,
                        format!("{} - dropped fragment header: {error}", packet.tracker()),
                    );
                    return;
                }
            };
        packet.marks.frag = LayerMark::ok(start);
        let payload_len = payload_range.1 - payload_range.0;
        if more && payload_len % 8 != 0 {
            // Every fragment but the last must keep 8-byte alignment.
            packet.marks.frag = LayerMark::malformed(start);
            StackCounters::bump(&mut self.counters.rx_parse_errors);
            return;
        }
        let key = FragKey { src, dst, id, next };
        let tracker = packet.tracker().clone();
        let payload = &packet.frame()[payload_range.0..payload_range.1];
        match self
            .reassembly
            .push(key, frag_offset, more, payload, &tracker, Instant::now())
        {
            FragPush::Stored | FragPush::Duplicate => {}
            FragPush::Poisoned => {
                StackCounters::bump(&mut self.counters.reassembly_poisoned);
            }
            FragPush::TooBig | FragPush::ResourceLimit => {
                StackCounters::bump(&mut self.counters.reassembly_limit_drops);
            }
            FragPush::Complete {
                next,
                payload,
                tracker,
            } => {
                StackCounters::bump(&mut self.counters.reassembly_completed);
                // Re-synthesize the datagram as if it arrived unfragmented.
                let mut frame = vec![0u8; IP6_HEADER_LEN + payload.len()];
                frame[0] = 0x60;
                crate::codec::put_u16(&mut frame, 4, payload.len() as u16);
                frame[6] = next;
                frame[7] = ip6::IP6_DEFAULT_HOP;
                frame[8..24].copy_from_slice(&src.octets());
                frame[24..40].copy_from_slice(&dst.octets());
                frame[IP6_HEADER_LEN..].copy_from_slice(&payload);
                let mut reassembled = PacketRx::new_descendant(frame, &tracker);
                self.rx_ip6(&mut reassembled, 0, false);
            }
        }
    }

    fn rx_icmp4(
        &mut self,
        packet: &mut PacketRx,
        (start, end): (usize, usize),
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) {
        let message = match icmp4::parse(&packet.frame()[start..end]) {
            Ok(view) => view,
            Err(error) => {
                packet.marks.l4 = LayerMark::malformed(start);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::ICMP,
                    format!("{} - dropped ICMPv4: {error}", packet.tracker()),
                );
                return;
            }
        };
        let reply = match message {
            Icmp4View::EchoRequest { id, seq, data } if self.config.is_local_ip4(dst) => {
                Some((id, seq, data.to_vec()))
            }
            _ => None,
        };
        packet.marks.l4 = LayerMark::ok(start);
        let Some((id, seq, data)) = reply else {
            StackCounters::bump(&mut self.counters.rx_proto_drops);
            return;
        };
        logger::breadcrumb(
            BreadcrumbFlags::ICMP,
            format!("{} - echo request id {id} seq {seq} from {src}", packet.tracker()),
        );
        let reply = match Icmp4Assembler::new(
            Icmp4Message::EchoReply { id, seq, data },
            Some(packet.tracker()),
        ) {
            Ok(reply) => reply,
            Err(_) => return,
        };
        StackCounters::bump(&mut self.counters.echo_replies);
        self.tx_ip4(dst, src, Box::new(reply));
    }

    fn rx_icmp6(
        &mut self,
        packet: &mut PacketRx,
        (start, end): (usize, usize),
        src: Ipv6Addr,
        dst: Ipv6Addr,
    ) {
        let pshdr = pseudo_header_sum(
            IpAddr::V6(src),
            IpAddr::V6(dst),
            proto::PROTO_ICMP6,
            end - start,
        );
        enum Action {
            EchoReply { id: u16, seq: u16, data: Vec<u8> },
            Advertise { target: Ipv6Addr },
            Learn { addr: Ipv6Addr, mac: ether::MacAddr },
            None,
        }
        let action = match icmp6::parse(&packet.frame()[start..end], pshdr) {
            Ok(Icmp6View::EchoRequest { id, seq, data }) if self.config.is_local_ip6(dst) => {
                Action::EchoReply {
                    id,
                    seq,
                    data: data.to_vec(),
                }
            }
            Ok(Icmp6View::NeighborSolicitation { target, source_ll })
                if self.config.is_local_ip6(target) =>
            {
                if let Some(mac) = source_ll {
                    self.neighbors.learn(IpAddr::V6(src), mac);
                }
                Action::Advertise { target }
            }
            Ok(Icmp6View::NeighborAdvertisement {
                target, target_ll, ..
            }) => match target_ll {
                Some(mac) => Action::Learn { addr: target, mac },
                None => Action::None,
            },
            Ok(_) => Action::None,
            Err(error) => {
                packet.marks.l4 = LayerMark::malformed(start);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::ICMP,
                    format!("{} - dropped ICMPv6: {error}", packet.tracker()),
                );
                return;
            }
        };
        packet.marks.l4 = LayerMark::ok(start);
        match action {
            Action::EchoReply { id, seq, data } => {
                logger::breadcrumb(
                    BreadcrumbFlags::ICMP,
                    format!("{} - echo request id {id} seq {seq} from {src}", packet.tracker()),
                );
                let reply = match Icmp6Assembler::new(
                    Icmp6Message::EchoReply { id, seq, data },
                    Some(packet.tracker()),
                ) {
                    Ok(reply) => reply,
                    Err(_) => return,
                };
                StackCounters::bump(&mut self.counters.echo_replies);
                self.tx_ip6(dst, src, Box::new(reply));
            }
            Action::Advertise { target } => {
                let advertisement = match Icmp6Assembler::new(
                    Icmp6Message::NeighborAdvertisement {
                        target,
                        flag_router: false,
                        flag_solicited: true,
                        flag_override: true,
                        target_ll: Some(self.config.mac_addr),
                    },
                    Some(packet.tracker()),
                ) {
                    Ok(advertisement) => advertisement,
                    Err(_) => return,
                };
                StackCounters::bump(&mut self.counters.nd_advertisements);
                self.tx_ip6(target, src, Box::new(advertisement));
            }
            Action::Learn { addr, mac } => {
                self.neighbors.learn(IpAddr::V6(addr), mac);
            }
            Action::None => {}
        }
    }

    fn rx_udp(
        &mut self,
        packet: &mut PacketRx,
        (start, end): (usize, usize),
        src: IpAddr,
        dst: IpAddr,
        cksum_required: bool,
    ) {
        let pshdr = pseudo_header_sum(src, dst, proto::PROTO_UDP, end - start);
        let (sport, dport, payload) =
            match udp::parse(&packet.frame()[start..end], pshdr, cksum_required) {
                Ok(view) => (view.sport, view.dport, view.payload.to_vec()),
                Err(error) => {
                    packet.marks.l4 = LayerMark::malformed(start);
                    StackCounters::bump(&mut self.counters.rx_parse_errors);
                    logger::breadcrumb(
                        BreadcrumbFlags::UDP,
                        format!("{} - dropped UDP: {error}", packet.tracker()),
                    );
                    return;
                }
            };
        packet.marks.l4 = LayerMark::ok(start);
        logger::breadcrumb(
            BreadcrumbFlags::UDP,
            format!("{} - UDP {src}:{sport} -> {dst}:{dport}, {} bytes", packet.tracker(), payload.len()),
        );
        self.deliver(Delivery {
            l3_src: src,
            l3_dst: dst,
            l4_proto: proto::PROTO_UDP,
            sport,
            dport,
            payload,
            tracker: packet.tracker().clone(),
        });
    }

    fn rx_tcp(&mut self, packet: &mut PacketRx, (start, end): (usize, usize), src: IpAddr, dst: IpAddr) {
        let pshdr = pseudo_header_sum(src, dst, proto::PROTO_TCP, end - start);
        let (sport, dport, payload) = match tcp::parse(&packet.frame()[start..end], pshdr) {
            Ok(view) => (view.sport, view.dport, view.payload.to_vec()),
            Err(error) => {
                packet.marks.l4 = LayerMark::malformed(start);
                StackCounters::bump(&mut self.counters.rx_parse_errors);
                logger::breadcrumb(
                    BreadcrumbFlags::TCP,
                    format!("{} - dropped TCP: {error}", packet.tracker()),
                );
                return;
            }
        };
        packet.marks.l4 = LayerMark::ok(start);
        logger::breadcrumb(
            BreadcrumbFlags::TCP,
            format!("{} - TCP {src}:{sport} -> {dst}:{dport}, {} bytes", packet.tracker(), payload.len()),
        );
        self.deliver(Delivery {
            l3_src: src,
            l3_dst: dst,
            l4_proto: proto::PROTO_TCP,
            sport,
            dport,
            payload,
            tracker: packet.tracker().clone(),
        });
    }

    fn deliver(&mut self, delivery: Delivery) {
        match self.delivery_tx.try_send(delivery) {
            Ok(()) => StackCounters::bump(&mut self.counters.rx_delivered),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                StackCounters::bump(&mut self.counters.rx_delivery_overflow);
            }
        }
    }

    fn is_local_dst_ip4(&self, dst: Ipv4Addr) -> bool {
        self.config.is_local_ip4(dst)
            || dst.is_broadcast()
            || self
                .config
                .ip4_host
                .iter()
                .any(|host| host.broadcast() == dst)
            || dst == Ipv4Addr::new(224, 0, 0, 1)
    }

    fn is_local_dst_ip6(&self, dst: Ipv6Addr) -> bool {
        self.config.is_local_ip6(dst)
            || dst == Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)
            || self
                .config
                .ip6_host
                .iter()
                .any(|host| host.solicited_node() == dst)
    }
}
