//! tapstack: a user-space TCP/IP stack over a single host-side tap fd.
//!
//! Three long-lived workers move every packet: the RX reader drains the
//! tap into a bounded ring, one dispatcher thread walks frames through the
//! protocol handlers (and back down for transmit), and the TX writer
//! serializes assembled frames onto the fd. Shutdown is cooperative; every
//! blocking wait is bounded so `stop` completes within about a tick.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod frame;
pub mod logger;
pub mod neighbor;
pub mod proto;
pub mod ring;
pub mod rx_ring;
pub mod tracker;
pub mod tx_ring;

pub use config::StackConfig;
pub use dispatch::{Delivery, StackCounters, TxOutcome};
pub use frame::PacketRx;
pub use tracker::Tracker;

use crate::dispatch::Dispatcher;
use crate::logger::BreadcrumbFlags;
use crate::proto::Assembler;
use crate::rx_ring::RxRing;
use crate::tx_ring::TxRing;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// The stack engine: owns the rings, the dispatcher, and the worker
/// threads. Created once per tap interface.
pub struct StackEngine {
    config: Arc<StackConfig>,
    rx_ring: Arc<RxRing>,
    tx_ring: Arc<TxRing>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    deliveries: Receiver<Delivery>,
    running: Arc<AtomicBool>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StackEngine {
    pub fn new(mut config: StackConfig) -> Self {
        config.normalize();
        let config = Arc::new(config);
        let rx_ring = Arc::new(RxRing::new(config.rx_ring_capacity));
        let tx_ring = Arc::new(TxRing::new(config.tx_ring_capacity));
        let (dispatcher, deliveries) = Dispatcher::new(Arc::clone(&config), Arc::clone(&tx_ring));
        logger::breadcrumb(
            BreadcrumbFlags::STACK,
            format!(
                "engine initialized (mtu={}, rx_cap={}, tx_cap={})",
                config.tap_mtu, config.rx_ring_capacity, config.tx_ring_capacity
            ),
        );
        Self {
            config,
            rx_ring,
            tx_ring,
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            deliveries,
            running: Arc::new(AtomicBool::new(false)),
            dispatch_thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Start the three workers on `fd`. The fd must yield raw Ethernet
    /// frames on read and accept them on write; the engine does not open
    /// or close it.
    pub fn start(&self, fd: RawFd) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("engine already started");
        }
        logger::breadcrumb(BreadcrumbFlags::STACK, "engine start requested");
        self.rx_ring
            .start(fd)
            .map_err(|error| anyhow::anyhow!("RX ring: {error}"))?;
        self.tx_ring
            .start(fd)
            .map_err(|error| anyhow::anyhow!("TX ring: {error}"))?;

        let running = Arc::clone(&self.running);
        let rx_ring = Arc::clone(&self.rx_ring);
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = std::thread::Builder::new()
            .name("tapstack-dispatch".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Some(packet) = rx_ring.dequeue() {
                        dispatcher.lock().handle_frame(packet);
                    }
                    // Timer work runs between dequeues on this thread.
                    dispatcher.lock().on_tick(Instant::now());
                }
            })?;
        *self.dispatch_thread.lock() = Some(handle);
        logger::breadcrumb(BreadcrumbFlags::STACK, "engine running");
        Ok(())
    }

    /// Cooperative shutdown; in-flight frames may be dropped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        logger::breadcrumb(BreadcrumbFlags::STACK, "engine stop requested");
        if let Some(handle) = self.dispatch_thread.lock().take() {
            let _ = handle.join();
        }
        let _ = self.rx_ring.stop();
        let _ = self.tx_ring.stop();
        logger::breadcrumb(BreadcrumbFlags::STACK, "engine stopped");
    }

    /// Upward interface: payloads the dispatcher delivered for the socket
    /// layer. The receiver can be cloned and moved to another thread.
    pub fn deliveries(&self) -> Receiver<Delivery> {
        self.deliveries.clone()
    }

    pub fn counters(&self) -> StackCounters {
        self.dispatcher.lock().counters()
    }

    /// Send one IPv4 datagram carrying `carried` (a UDP, TCP, or ICMPv4
    /// assembler).
    pub fn send_ip4(&self, src: Ipv4Addr, dst: Ipv4Addr, carried: Box<dyn Assembler>) -> TxOutcome {
        self.dispatcher.lock().tx_ip4(src, dst, carried)
    }

    /// Send one IPv6 datagram; oversize payloads are fragmented.
    pub fn send_ip6(&self, src: Ipv6Addr, dst: Ipv6Addr, carried: Box<dyn Assembler>) -> TxOutcome {
        self.dispatcher.lock().tx_ip6(src, dst, carried)
    }

    /// Push a raw frame into the RX path, bypassing the fd reader.
    pub fn inject_frame(&self, frame: Vec<u8>) {
        self.rx_ring.enqueue(PacketRx::new(frame));
    }
}

impl Drop for StackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ip4Host;
    use crate::proto::arp::{ArpAssembler, ARP_OP_REPLY, ARP_OP_REQUEST};
    use crate::proto::ether::{EtherAssembler, MacAddr, ETHER_TYPE_ARP, ETHER_TYPE_IP4};
    use crate::proto::icmp4::{Icmp4Assembler, Icmp4Message, Icmp4View};
    use crate::proto::ip4::Ip4Assembler;
    use crate::proto::{arp, ether, icmp4, ip4};
    use std::time::Duration;

    const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x07]);
    const PEER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x66]);

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let status = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(status, 0);
        (fds[0], fds[1])
    }

    fn read_frame(fd: RawFd, timeout_ms: i32) -> Option<Vec<u8>> {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready <= 0 {
            return None;
        }
        let mut buffer = vec![0u8; 2048];
        let count = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if count <= 0 {
            return None;
        }
        buffer.truncate(count as usize);
        Some(buffer)
    }

    fn write_frame(fd: RawFd, frame: &[u8]) {
        let written = unsafe { libc::write(fd, frame.as_ptr().cast(), frame.len()) };
        assert_eq!(written, frame.len() as isize);
    }

    fn engine_config() -> StackConfig {
        StackConfig {
            mac_addr: OUR_MAC,
            ip4_host: vec![Ip4Host::new(Ipv4Addr::new(192, 168, 9, 7), 24)],
            ..Default::default()
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let (tap, other) = socketpair();
        let engine = StackEngine::new(engine_config());
        engine.start(tap).unwrap();
        assert!(engine.start(tap).is_err());
        engine.stop();
        unsafe {
            libc::close(tap);
            libc::close(other);
        }
    }

    #[test]
    fn arp_then_echo_round_trip_over_socketpair() {
        let (tap, peer) = socketpair();
        let engine = StackEngine::new(engine_config());
        engine.start(tap).unwrap();

        // ARP request teaches the stack the peer's MAC and earns a reply.
        let request = ArpAssembler::new(
            ARP_OP_REQUEST,
            PEER_MAC,
            Ipv4Addr::new(192, 168, 9, 102),
            MacAddr::UNSPECIFIED,
            Ipv4Addr::new(192, 168, 9, 7),
            None,
        )
        .unwrap();
        let ether = EtherAssembler::new(
            PEER_MAC,
            MacAddr::BROADCAST,
            ETHER_TYPE_ARP,
            Box::new(request),
        );
        let mut frame = vec![0u8; ether.len()];
        ether.assemble(&mut frame, 0);
        write_frame(peer, &frame);

        let reply = read_frame(peer, 2000).expect("ARP reply expected");
        let eth = ether::parse(&reply).unwrap();
        assert_eq!(eth.ether_type, ETHER_TYPE_ARP);
        assert_eq!(arp::parse(eth.payload).unwrap().oper, ARP_OP_REPLY);

        // Echo request now round-trips end to end.
        let echo = Icmp4Assembler::new(
            Icmp4Message::EchoRequest {
                id: 7,
                seq: 1,
                data: b"tapstack".to_vec(),
            },
            None,
        )
        .unwrap();
        let packet = Ip4Assembler::new(
            Ipv4Addr::new(192, 168, 9, 102),
            Ipv4Addr::new(192, 168, 9, 7),
            Box::new(echo),
        );
        let ether = EtherAssembler::new(PEER_MAC, OUR_MAC, ETHER_TYPE_IP4, Box::new(packet));
        let mut frame = vec![0u8; ether.len()];
        ether.assemble(&mut frame, 0);
        write_frame(peer, &frame);

        let reply = read_frame(peer, 2000).expect("echo reply expected");
        let eth = ether::parse(&reply).unwrap();
        let ip = ip4::parse(eth.payload).unwrap();
        match icmp4::parse(ip.payload).unwrap() {
            Icmp4View::EchoReply { id, seq, data } => {
                assert_eq!(id, 7);
                assert_eq!(seq, 1);
                assert_eq!(data, b"tapstack");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        engine.stop();
        // Stop is prompt: the workers observe the flag within a tick.
        std::thread::sleep(Duration::from_millis(10));
        unsafe {
            libc::close(tap);
            libc::close(peer);
        }
    }
}
