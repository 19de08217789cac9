//! Standalone runner: opens a Linux tap device, runs the stack engine on
//! it, and prints deliveries until interrupted.
//!
//! The interface still needs host-side configuration, e.g.:
//!   sudo ip link set tap7 up
//!   sudo ip addr add 192.168.9.1/24 dev tap7

use std::env;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tapstack::config::{Ip4Host, Ip6Host};
use tapstack::logger::{self, BreadcrumbFlags};
use tapstack::{StackConfig, StackEngine};

#[cfg(not(target_os = "linux"))]
compile_error!("the standalone runner drives a Linux tap device");

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    logger::install_stderr_sink(Some(settings.log_level.as_str()));
    if settings.breadcrumbs {
        logger::set_breadcrumb_mask(BreadcrumbFlags::ALL);
    }

    let mut config = StackConfig::from_env();
    config.tap_mtu = settings.mtu;
    config.ip4_host = settings.ip4_host.clone();
    config.ip4_gateway = settings.ip4_gateway;
    config.ip6_host = settings.ip6_host.clone();
    config.ip6_gateway = settings.ip6_gateway;

    let tap = open_tap(&settings.ifname)?;
    eprintln!(
        "[standalone] tap {} open (mtu={}, mac={})",
        settings.ifname, config.tap_mtu, config.mac_addr
    );

    let engine = StackEngine::new(config);
    engine.start(tap.as_raw_fd())?;
    let deliveries = engine.deliveries();

    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_interrupt as libc::sighandler_t);
    }

    while !INTERRUPTED.load(Ordering::SeqCst) {
        match deliveries.recv_timeout(Duration::from_millis(500)) {
            Ok(delivery) => {
                println!(
                    "{} proto {} {}:{} -> {}:{} ({} bytes)",
                    delivery.tracker,
                    delivery.l4_proto,
                    delivery.l3_src,
                    delivery.sport,
                    delivery.l3_dst,
                    delivery.dport,
                    delivery.payload.len()
                );
            }
            Err(_) => continue,
        }
    }

    engine.stop();
    let counters = engine.counters();
    eprintln!(
        "[standalone] stopped: {} frames in, {} delivered, {} sent, {} reassembled",
        counters.rx_frames, counters.rx_delivered, counters.tx_passed, counters.reassembly_completed
    );
    Ok(())
}

#[derive(Debug)]
struct Settings {
    ifname: String,
    mtu: usize,
    ip4_host: Vec<Ip4Host>,
    ip4_gateway: Option<Ipv4Addr>,
    ip6_host: Vec<Ip6Host>,
    ip6_gateway: Option<Ipv6Addr>,
    log_level: String,
    breadcrumbs: bool,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut ifname = String::from("tap7");
        let mut mtu = 1500;
        let mut ip4_host = Vec::new();
        let mut ip4_gateway = None;
        let mut ip6_host = Vec::new();
        let mut ip6_gateway = None;
        let mut log_level = String::from("info");
        let mut breadcrumbs = false;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--ifname" => {
                    ifname = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--ifname requires a value"))?;
                }
                "--mtu" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--mtu requires a value"))?;
                    mtu = value.parse().map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                }
                "--ip4" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--ip4 requires addr/prefix"))?;
                    ip4_host.push(parse_ip4_host(&value)?);
                }
                "--gw4" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--gw4 requires a value"))?;
                    ip4_gateway =
                        Some(value.parse().map_err(|_| anyhow::anyhow!("invalid gw4"))?);
                }
                "--ip6" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--ip6 requires addr/prefix"))?;
                    ip6_host.push(parse_ip6_host(&value)?);
                }
                "--gw6" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--gw6 requires a value"))?;
                    ip6_gateway =
                        Some(value.parse().map_err(|_| anyhow::anyhow!("invalid gw6"))?);
                }
                "--log" => {
                    log_level = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--log requires a level"))?;
                }
                "--breadcrumbs" => {
                    breadcrumbs = true;
                }
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported: --ifname <name>, --mtu <value>, \
                         --ip4 <addr/prefix>, --gw4 <addr>, --ip6 <addr/prefix>, --gw6 <addr>, \
                         --log <level>, --breadcrumbs",
                        arg
                    );
                }
            }
        }
        Ok(Self {
            ifname,
            mtu,
            ip4_host,
            ip4_gateway,
            ip6_host,
            ip6_gateway,
            log_level,
            breadcrumbs,
        })
    }
}

fn parse_ip4_host(value: &str) -> anyhow::Result<Ip4Host> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("expected addr/prefix, got '{value}'"))?;
    Ok(Ip4Host::new(
        addr.parse().map_err(|_| anyhow::anyhow!("invalid IPv4 address"))?,
        prefix.parse().map_err(|_| anyhow::anyhow!("invalid prefix length"))?,
    ))
}

fn parse_ip6_host(value: &str) -> anyhow::Result<Ip6Host> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("expected addr/prefix, got '{value}'"))?;
    Ok(Ip6Host::new(
        addr.parse().map_err(|_| anyhow::anyhow!("invalid IPv6 address"))?,
        prefix.parse().map_err(|_| anyhow::anyhow!("invalid prefix length"))?,
    ))
}

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open `/dev/net/tun` and attach it to the named tap interface.
fn open_tap(ifname: &str) -> anyhow::Result<OwnedFd> {
    if ifname.len() >= libc::IFNAMSIZ {
        anyhow::bail!("interface name '{ifname}' too long");
    }
    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr().cast(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut request = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    request.name[..ifname.len()].copy_from_slice(ifname.as_bytes());
    let status = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &request) };
    if status < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}
