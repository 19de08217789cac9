//! Wire-format parsers and assemblers for every protocol the stack speaks.
//!
//! Parsing is zero-copy: `parse` returns a view borrowing the frame and
//! recording offsets. Assembly is the inverse: a typed record writes its
//! exact wire length into a caller-supplied buffer, recursing into the
//! carried packet for the trailing bytes before the checksum is placed.

pub mod arp;
pub mod ether;
pub mod icmp4;
pub mod icmp6;
pub mod ip4;
pub mod ip6;
pub mod ip6_frag;
pub mod tcp;
pub mod udp;

use crate::codec;
use crate::tracker::Tracker;
use std::net::IpAddr;
use thiserror::Error;

pub const PROTO_ICMP4: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_IP6_FRAG: u8 = 44;
pub const PROTO_ICMP6: u8 = 58;
pub const PROTO_RAW: u8 = 255;

/// Why an inbound header was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("header truncated")]
    TooShort,
    #[error("version field does not match family")]
    BadVersion,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("unsupported header or option")]
    Unsupported,
}

/// Why an assembler could not be constructed. Validation happens here, at
/// construction, never inside `assemble`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0} out of range")]
    FieldRange(&'static str),
    #[error("invalid type/code combination {kind}/{code}")]
    TypeCode { kind: u8, code: u8 },
    #[error("payload exceeds {0} bytes")]
    PayloadTooLong(usize),
}

/// Capability interface every outbound packet record implements.
///
/// `assemble` writes exactly `len()` bytes into `frame`. Layers that carry
/// another packet write their own header with a zeroed checksum, invoke the
/// carried assembler on the trailing subslice, then overwrite the checksum
/// field.
pub trait Assembler: Send {
    /// Wire length, a pure function of the fields.
    fn len(&self) -> usize;

    /// Value for the enclosing header's next-header / protocol field.
    fn proto(&self) -> u8;

    /// L4 pseudo-header partial sum against the enclosing L3 addresses;
    /// zero for layers without one.
    fn pshdr_sum(&self, src: IpAddr, dst: IpAddr) -> u32 {
        let _ = (src, dst);
        0
    }

    fn assemble(&self, frame: &mut [u8], pshdr_sum: u32);

    fn tracker(&self) -> &Tracker;
}

/// Partial checksum over an IPv4 or IPv6 pseudo-header (addresses, upper
/// layer length, protocol number). Families of `src` and `dst` always match
/// because only an IP assembler supplies them.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u32 {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut pshdr = [0u8; 12];
            pshdr[0..4].copy_from_slice(&src.octets());
            pshdr[4..8].copy_from_slice(&dst.octets());
            pshdr[9] = proto;
            codec::put_u16(&mut pshdr, 10, len as u16);
            codec::partial_sum(&pshdr)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut pshdr = [0u8; 40];
            pshdr[0..16].copy_from_slice(&src.octets());
            pshdr[16..32].copy_from_slice(&dst.octets());
            codec::put_u32(&mut pshdr, 32, len as u32);
            pshdr[39] = proto;
            codec::partial_sum(&pshdr)
        }
        _ => 0,
    }
}

/// Raw byte payload carried at the bottom of an assembler chain.
#[derive(Debug)]
pub struct RawAssembler {
    data: Vec<u8>,
    proto: u8,
    tracker: Tracker,
}

impl RawAssembler {
    pub fn new(proto: u8, data: Vec<u8>) -> Self {
        Self {
            data,
            proto,
            tracker: Tracker::new(crate::tracker::TrackerPrefix::Tx),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Assembler for RawAssembler {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn proto(&self) -> u8 {
        self.proto
    }

    fn assemble(&self, frame: &mut [u8], _pshdr_sum: u32) {
        frame[..self.data.len()].copy_from_slice(&self.data);
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}
