//! ICMPv4 (RFC 792): echo request/reply and destination unreachable.

use super::{Assembler, BuildError, ParseError};
use crate::codec;
use crate::tracker::{Tracker, TrackerPrefix};

pub const ICMP4_ECHO_REPLY: u8 = 0;
pub const ICMP4_UNREACHABLE: u8 = 3;
pub const ICMP4_ECHO_REQUEST: u8 = 8;

pub const ICMP4_UNREACHABLE_PORT: u8 = 3;

pub const ICMP4_ECHO_HEADER_LEN: usize = 8;
pub const ICMP4_UNREACHABLE_HEADER_LEN: usize = 8;

/// Unreachable messages quote at most this much of the offending datagram.
const UNREACHABLE_QUOTE_CAP: usize = 520;

/// Parsed view of an ICMPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmp4View<'a> {
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
    Unreachable {
        code: u8,
        data: &'a [u8],
    },
}

pub fn parse(frame: &[u8]) -> Result<Icmp4View<'_>, ParseError> {
    if frame.len() < 4 {
        return Err(ParseError::TooShort);
    }
    if codec::inet_cksum(frame, 0) != 0xFFFF {
        return Err(ParseError::BadChecksum);
    }
    let kind = frame[0];
    let code = frame[1];
    match kind {
        ICMP4_ECHO_REQUEST | ICMP4_ECHO_REPLY => {
            if code != 0 {
                return Err(ParseError::Unsupported);
            }
            if frame.len() < ICMP4_ECHO_HEADER_LEN {
                return Err(ParseError::TooShort);
            }
            let id = codec::get_u16(frame, 4);
            let seq = codec::get_u16(frame, 6);
            let data = &frame[ICMP4_ECHO_HEADER_LEN..];
            Ok(if kind == ICMP4_ECHO_REQUEST {
                Icmp4View::EchoRequest { id, seq, data }
            } else {
                Icmp4View::EchoReply { id, seq, data }
            })
        }
        ICMP4_UNREACHABLE => {
            if code > 15 {
                return Err(ParseError::Unsupported);
            }
            if frame.len() < ICMP4_UNREACHABLE_HEADER_LEN {
                return Err(ParseError::TooShort);
            }
            Ok(Icmp4View::Unreachable {
                code,
                data: &frame[ICMP4_UNREACHABLE_HEADER_LEN..],
            })
        }
        _ => Err(ParseError::Unsupported),
    }
}

/// Typed ICMPv4 message for the TX path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmp4Message {
    EchoRequest { id: u16, seq: u16, data: Vec<u8> },
    EchoReply { id: u16, seq: u16, data: Vec<u8> },
    Unreachable { code: u8, data: Vec<u8> },
}

pub struct Icmp4Assembler {
    message: Icmp4Message,
    tracker: Tracker,
}

impl Icmp4Assembler {
    pub fn new(message: Icmp4Message, echo_tracker: Option<&Tracker>) -> Result<Self, BuildError> {
        let message = match message {
            Icmp4Message::Unreachable { code, mut data } => {
                if code > 15 {
                    return Err(BuildError::TypeCode {
                        kind: ICMP4_UNREACHABLE,
                        code,
                    });
                }
                data.truncate(UNREACHABLE_QUOTE_CAP);
                Icmp4Message::Unreachable { code, data }
            }
            other => other,
        };
        let tracker = match echo_tracker {
            Some(echo) => Tracker::new_echo(TrackerPrefix::Tx, echo),
            None => Tracker::new(TrackerPrefix::Tx),
        };
        Ok(Self { message, tracker })
    }

    pub fn message(&self) -> &Icmp4Message {
        &self.message
    }
}

impl Assembler for Icmp4Assembler {
    fn len(&self) -> usize {
        match &self.message {
            Icmp4Message::EchoRequest { data, .. } | Icmp4Message::EchoReply { data, .. } => {
                ICMP4_ECHO_HEADER_LEN + data.len()
            }
            Icmp4Message::Unreachable { data, .. } => ICMP4_UNREACHABLE_HEADER_LEN + data.len(),
        }
    }

    fn proto(&self) -> u8 {
        super::PROTO_ICMP4
    }

    fn assemble(&self, frame: &mut [u8], _pshdr_sum: u32) {
        match &self.message {
            Icmp4Message::EchoRequest { id, seq, data }
            | Icmp4Message::EchoReply { id, seq, data } => {
                frame[0] = if matches!(self.message, Icmp4Message::EchoRequest { .. }) {
                    ICMP4_ECHO_REQUEST
                } else {
                    ICMP4_ECHO_REPLY
                };
                frame[1] = 0;
                codec::put_u16(frame, 2, 0);
                codec::put_u16(frame, 4, *id);
                codec::put_u16(frame, 6, *seq);
                frame[ICMP4_ECHO_HEADER_LEN..ICMP4_ECHO_HEADER_LEN + data.len()]
                    .copy_from_slice(data);
            }
            Icmp4Message::Unreachable { code, data } => {
                frame[0] = ICMP4_UNREACHABLE;
                frame[1] = *code;
                codec::put_u16(frame, 2, 0);
                codec::put_u32(frame, 4, 0);
                frame[ICMP4_UNREACHABLE_HEADER_LEN..ICMP4_UNREACHABLE_HEADER_LEN + data.len()]
                    .copy_from_slice(data);
            }
        }
        // ICMPv4 has no pseudo-header; checksum covers the message alone.
        let len = self.len();
        let cksum = codec::inet_cksum(&frame[..len], 0);
        codec::put_u16(frame, 2, cksum);
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_wire_bytes() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::EchoRequest {
                id: 12345,
                seq: 54321,
                data: b"0123456789ABCDEF".to_vec(),
            },
            None,
        )
        .unwrap();
        let mut frame = vec![0u8; packet.len()];
        packet.assemble(&mut frame, 0);
        assert_eq!(&frame, b"\x08\x00\x24\xbe\x30\x39\xd4\x310123456789ABCDEF");
    }

    #[test]
    fn echo_reply_wire_bytes() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::EchoReply {
                id: 12345,
                seq: 54321,
                data: b"0123456789ABCDEF".to_vec(),
            },
            None,
        )
        .unwrap();
        let mut frame = vec![0u8; packet.len()];
        packet.assemble(&mut frame, 0);
        assert_eq!(&frame, b"\x00\x00\x2c\xbe\x30\x39\xd4\x310123456789ABCDEF");
    }

    #[test]
    fn unreachable_port_wire_bytes() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::Unreachable {
                code: ICMP4_UNREACHABLE_PORT,
                data: b"0123456789ABCDEF".to_vec(),
            },
            None,
        )
        .unwrap();
        let mut frame = vec![0u8; packet.len()];
        packet.assemble(&mut frame, 0);
        assert_eq!(
            &frame,
            b"\x03\x03\x2e\x26\x00\x00\x00\x000123456789ABCDEF"
        );
    }

    #[test]
    fn assembled_message_parses_back() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::EchoRequest {
                id: 7,
                seq: 9,
                data: vec![0xAB; 32],
            },
            None,
        )
        .unwrap();
        let mut frame = vec![0u8; packet.len()];
        packet.assemble(&mut frame, 0);
        match parse(&frame).unwrap() {
            Icmp4View::EchoRequest { id, seq, data } => {
                assert_eq!(id, 7);
                assert_eq!(seq, 9);
                assert_eq!(data, &[0xAB; 32]);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_corrupted_checksum() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::EchoReply {
                id: 1,
                seq: 2,
                data: vec![],
            },
            None,
        )
        .unwrap();
        let mut frame = vec![0u8; packet.len()];
        packet.assemble(&mut frame, 0);
        frame[4] ^= 0xFF;
        assert!(matches!(parse(&frame), Err(ParseError::BadChecksum)));
    }

    #[test]
    fn unreachable_quote_is_capped() {
        let packet = Icmp4Assembler::new(
            Icmp4Message::Unreachable {
                code: ICMP4_UNREACHABLE_PORT,
                data: vec![0x42; 800],
            },
            None,
        )
        .unwrap();
        assert_eq!(packet.len(), ICMP4_UNREACHABLE_HEADER_LEN + 520);
    }

    #[test]
    fn unknown_unreachable_code_rejected_at_build() {
        let result = Icmp4Assembler::new(
            Icmp4Message::Unreachable {
                code: 99,
                data: vec![],
            },
            None,
        );
        assert!(matches!(result, Err(BuildError::TypeCode { .. })));
    }

    #[test]
    fn reply_records_request_tracker() {
        let request = Tracker::new(TrackerPrefix::Rx);
        let packet = Icmp4Assembler::new(
            Icmp4Message::EchoReply {
                id: 1,
                seq: 1,
                data: vec![],
            },
            Some(&request),
        )
        .unwrap();
        assert_eq!(packet.tracker().echo(), Some(&request));
    }
}
