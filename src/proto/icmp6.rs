//! ICMPv6 (RFC 4443) and the ND subset the stack needs (RFC 4861):
//! echo request/reply, time exceeded, neighbor solicitation/advertisement.

use super::ether::MacAddr;
use super::{Assembler, BuildError, ParseError};
use crate::codec;
use crate::tracker::{Tracker, TrackerPrefix};
use std::net::{IpAddr, Ipv6Addr};

pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ICMP6_ND_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMP6_ND_NEIGHBOR_ADVERTISEMENT: u8 = 136;

/// Fragment reassembly time exceeded (RFC 4443 §3.3).
pub const ICMP6_TIME_EXCEEDED_REASSEMBLY: u8 = 1;

const ND_OPT_SOURCE_LL: u8 = 1;
const ND_OPT_TARGET_LL: u8 = 2;

/// Parsed view of an ICMPv6 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmp6View<'a> {
    EchoRequest {
        id: u16,
        seq: u16,
        data: &'a [u8],
    },
    EchoReply {
        id: u16,
        seq: u16,
        data: &'a [u8],
    },
    TimeExceeded {
        code: u8,
        data: &'a [u8],
    },
    NeighborSolicitation {
        target: Ipv6Addr,
        source_ll: Option<MacAddr>,
    },
    NeighborAdvertisement {
        target: Ipv6Addr,
        flag_router: bool,
        flag_solicited: bool,
        flag_override: bool,
        target_ll: Option<MacAddr>,
    },
}

/// `pshdr_sum` is the IPv6 pseudo-header partial sum for this message; the
/// checksum is always verified against it.
pub fn parse(frame: &[u8], pshdr_sum: u32) -> Result<Icmp6View<'_>, ParseError> {
    if frame.len() < 4 {
        return Err(ParseError::TooShort);
    }
    if codec::inet_cksum(frame, pshdr_sum) != 0xFFFF {
        return Err(ParseError::BadChecksum);
    }
    let kind = frame[0];
    let code = frame[1];
    match kind {
        ICMP6_ECHO_REQUEST | ICMP6_ECHO_REPLY => {
            if code != 0 {
                return Err(ParseError::Unsupported);
            }
            if frame.len() < 8 {
                return Err(ParseError::TooShort);
            }
            let id = codec::get_u16(frame, 4);
            let seq = codec::get_u16(frame, 6);
            let data = &frame[8..];
            Ok(if kind == ICMP6_ECHO_REQUEST {
                Icmp6View::EchoRequest { id, seq, data }
            } else {
                Icmp6View::EchoReply { id, seq, data }
            })
        }
        ICMP6_TIME_EXCEEDED => {
            if frame.len() < 8 {
                return Err(ParseError::TooShort);
            }
            Ok(Icmp6View::TimeExceeded {
                code,
                data: &frame[8..],
            })
        }
        ICMP6_ND_NEIGHBOR_SOLICITATION => {
            if frame.len() < 24 {
                return Err(ParseError::TooShort);
            }
            let target = Ipv6Addr::from(codec::get_u128(frame, 8));
            let source_ll = parse_ll_option(&frame[24..], ND_OPT_SOURCE_LL)?;
            Ok(Icmp6View::NeighborSolicitation { target, source_ll })
        }
        ICMP6_ND_NEIGHBOR_ADVERTISEMENT => {
            if frame.len() < 24 {
                return Err(ParseError::TooShort);
            }
            let flags = frame[4];
            let target = Ipv6Addr::from(codec::get_u128(frame, 8));
            let target_ll = parse_ll_option(&frame[24..], ND_OPT_TARGET_LL)?;
            Ok(Icmp6View::NeighborAdvertisement {
                target,
                flag_router: flags & 0x80 != 0,
                flag_solicited: flags & 0x40 != 0,
                flag_override: flags & 0x20 != 0,
                target_ll,
            })
        }
        _ => Err(ParseError::Unsupported),
    }
}

/// Walk ND options looking for one link-layer address option.
fn parse_ll_option(options: &[u8], wanted: u8) -> Result<Option<MacAddr>, ParseError> {
    let mut offset = 0;
    while offset < options.len() {
        if offset + 2 > options.len() {
            return Err(ParseError::Unsupported);
        }
        let opt_type = options[offset];
        let opt_len = usize::from(options[offset + 1]) * 8;
        if opt_len == 0 || offset + opt_len > options.len() {
            return Err(ParseError::Unsupported);
        }
        if opt_type == wanted && opt_len == 8 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&options[offset + 2..offset + 8]);
            return Ok(Some(MacAddr(mac)));
        }
        offset += opt_len;
    }
    Ok(None)
}

/// Typed ICMPv6 message for the TX path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmp6Message {
    EchoRequest {
        id: u16,
        seq: u16,
        data: Vec<u8>,
    },
    EchoReply {
        id: u16,
        seq: u16,
        data: Vec<u8>,
    },
    TimeExceeded {
        code: u8,
        data: Vec<u8>,
    },
    NeighborSolicitation {
        target: Ipv6Addr,
        source_ll: Option<MacAddr>,
    },
    NeighborAdvertisement {
        target: Ipv6Addr,
        flag_router: bool,
        flag_solicited: bool,
        flag_override: bool,
        target_ll: Option<MacAddr>,
    },
}

pub struct Icmp6Assembler {
    message: Icmp6Message,
    tracker: Tracker,
}

impl Icmp6Assembler {
    pub fn new(message: Icmp6Message, echo_tracker: Option<&Tracker>) -> Result<Self, BuildError> {
        if let Icmp6Message::TimeExceeded { code, .. } = &message {
            if *code > 1 {
                return Err(BuildError::TypeCode {
                    kind: ICMP6_TIME_EXCEEDED,
                    code: *code,
                });
            }
        }
        let tracker = match echo_tracker {
            Some(echo) => Tracker::new_echo(TrackerPrefix::Tx, echo),
            None => Tracker::new(TrackerPrefix::Tx),
        };
        Ok(Self { message, tracker })
    }

    pub fn message(&self) -> &Icmp6Message {
        &self.message
    }
}

impl Assembler for Icmp6Assembler {
    fn len(&self) -> usize {
        match &self.message {
            Icmp6Message::EchoRequest { data, .. } | Icmp6Message::EchoReply { data, .. } => {
                8 + data.len()
            }
            Icmp6Message::TimeExceeded { data, .. } => 8 + data.len(),
            Icmp6Message::NeighborSolicitation { source_ll, .. } => {
                24 + if source_ll.is_some() { 8 } else { 0 }
            }
            Icmp6Message::NeighborAdvertisement { target_ll, .. } => {
                24 + if target_ll.is_some() { 8 } else { 0 }
            }
        }
    }

    fn proto(&self) -> u8 {
        super::PROTO_ICMP6
    }

    fn pshdr_sum(&self, src: IpAddr, dst: IpAddr) -> u32 {
        super::pseudo_header_sum(src, dst, super::PROTO_ICMP6, self.len())
    }

    fn assemble(&self, frame: &mut [u8], pshdr_sum: u32) {
        codec::put_u16(frame, 2, 0);
        match &self.message {
            Icmp6Message::EchoRequest { id, seq, data }
            | Icmp6Message::EchoReply { id, seq, data } => {
                frame[0] = if matches!(self.message, Icmp6Message::EchoRequest { .. }) {
                    ICMP6_ECHO_REQUEST
                } else {
                    ICMP6_ECHO_REPLY
                };
                frame[1] = 0;
                codec::put_u16(frame, 4, *id);
                codec::put_u16(frame, 6, *seq);
                frame[8..8 + data.len()].copy_from_slice(data);
            }
            Icmp6Message::TimeExceeded { code, data } => {
                frame[0] = ICMP6_TIME_EXCEEDED;
                frame[1] = *code;
                codec::put_u32(frame, 4, 0);
                frame[8..8 + data.len()].copy_from_slice(data);
            }
            Icmp6Message::NeighborSolicitation { target, source_ll } => {
                frame[0] = ICMP6_ND_NEIGHBOR_SOLICITATION;
                frame[1] = 0;
                codec::put_u32(frame, 4, 0);
                frame[8..24].copy_from_slice(&target.octets());
                if let Some(mac) = source_ll {
                    frame[24] = ND_OPT_SOURCE_LL;
                    frame[25] = 1;
                    frame[26..32].copy_from_slice(&mac.0);
                }
            }
            Icmp6Message::NeighborAdvertisement {
                target,
                flag_router,
                flag_solicited,
                flag_override,
                target_ll,
            } => {
                frame[0] = ICMP6_ND_NEIGHBOR_ADVERTISEMENT;
                frame[1] = 0;
                let mut flags = 0u8;
                if *flag_router {
                    flags |= 0x80;
                }
                if *flag_solicited {
                    flags |= 0x40;
                }
                if *flag_override {
                    flags |= 0x20;
                }
                frame[4] = flags;
                frame[5] = 0;
                codec::put_u16(frame, 6, 0);
                frame[8..24].copy_from_slice(&target.octets());
                if let Some(mac) = target_ll {
                    frame[24] = ND_OPT_TARGET_LL;
                    frame[25] = 1;
                    frame[26..32].copy_from_slice(&mac.0);
                }
            }
        }
        let len = self.len();
        let cksum = codec::inet_cksum(&frame[..len], pshdr_sum);
        codec::put_u16(frame, 2, cksum);
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}
