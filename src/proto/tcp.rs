//! TCP (RFC 793): segment parsing and assembly with the customary
//! pseudo-header checksum. Option support covers what a connection setup
//! needs; unknown inbound options are length-validated and skipped.

use super::{Assembler, BuildError, ParseError};
use crate::codec;
use crate::tracker::{Tracker, TrackerPrefix};
use std::net::IpAddr;

pub const TCP_HEADER_LEN: usize = 20;

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        u8::from(self.fin)
            | u8::from(self.syn) << 1
            | u8::from(self.rst) << 2
            | u8::from(self.psh) << 3
            | u8::from(self.ack) << 4
            | u8::from(self.urg) << 5
    }
}

/// Parsed view of a TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpView<'a> {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub hlen: usize,
    pub flags: TcpFlags,
    pub win: u16,
    pub urg: u16,
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

pub fn parse(frame: &[u8], pshdr_sum: u32) -> Result<TcpView<'_>, ParseError> {
    if frame.len() < TCP_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    let hlen = usize::from(frame[12] >> 4) * 4;
    if hlen < TCP_HEADER_LEN || hlen > frame.len() {
        return Err(ParseError::TooShort);
    }
    if codec::inet_cksum(frame, pshdr_sum) != 0xFFFF {
        return Err(ParseError::BadChecksum);
    }
    let options = &frame[TCP_HEADER_LEN..hlen];
    let (mss, wscale) = walk_options(options)?;
    Ok(TcpView {
        sport: codec::get_u16(frame, 0),
        dport: codec::get_u16(frame, 2),
        seq: codec::get_u32(frame, 4),
        ack: codec::get_u32(frame, 8),
        hlen,
        flags: TcpFlags::from_byte(frame[13]),
        win: codec::get_u16(frame, 14),
        urg: codec::get_u16(frame, 18),
        mss,
        wscale,
        options,
        payload: &frame[hlen..],
    })
}

fn walk_options(options: &[u8]) -> Result<(Option<u16>, Option<u8>), ParseError> {
    let mut mss = None;
    let mut wscale = None;
    let mut offset = 0;
    while offset < options.len() {
        match options[offset] {
            OPT_EOL => break,
            OPT_NOP => offset += 1,
            kind => {
                if offset + 1 >= options.len() {
                    return Err(ParseError::Unsupported);
                }
                let opt_len = options[offset + 1] as usize;
                if opt_len < 2 || offset + opt_len > options.len() {
                    return Err(ParseError::Unsupported);
                }
                match kind {
                    OPT_MSS if opt_len == 4 => {
                        mss = Some(codec::get_u16(options, offset + 2));
                    }
                    OPT_WSCALE if opt_len == 3 => {
                        wscale = Some(options[offset + 2]);
                    }
                    _ => {}
                }
                offset += opt_len;
            }
        }
    }
    Ok((mss, wscale))
}

/// TCP options the assembler can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    Wscale(u8),
    Nop,
    Eol,
}

impl TcpOption {
    fn wire_len(self) -> usize {
        match self {
            TcpOption::Mss(_) => 4,
            TcpOption::Wscale(_) => 3,
            TcpOption::Nop | TcpOption::Eol => 1,
        }
    }

    fn write(self, buf: &mut [u8]) {
        match self {
            TcpOption::Mss(mss) => {
                buf[0] = OPT_MSS;
                buf[1] = 4;
                codec::put_u16(buf, 2, mss);
            }
            TcpOption::Wscale(shift) => {
                buf[0] = OPT_WSCALE;
                buf[1] = 3;
                buf[2] = shift;
            }
            TcpOption::Nop => buf[0] = OPT_NOP,
            TcpOption::Eol => buf[0] = OPT_EOL,
        }
    }
}

/// Outbound TCP segment.
pub struct TcpAssembler {
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    win: u16,
    urg: u16,
    options: Vec<TcpOption>,
    data: Vec<u8>,
    tracker: Tracker,
}

impl TcpAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        win: u16,
        options: Vec<TcpOption>,
        data: Vec<u8>,
    ) -> Result<Self, BuildError> {
        let raw_opt_len: usize = options.iter().map(|option| option.wire_len()).sum();
        if TCP_HEADER_LEN + pad4(raw_opt_len) > 60 {
            return Err(BuildError::FieldRange("options"));
        }
        Ok(Self {
            sport,
            dport,
            seq,
            ack,
            flags,
            win,
            urg: 0,
            options,
            data,
            tracker: Tracker::new(TrackerPrefix::Tx),
        })
    }

    fn options_len(&self) -> usize {
        pad4(self.options.iter().map(|option| option.wire_len()).sum())
    }

    pub fn hlen(&self) -> usize {
        TCP_HEADER_LEN + self.options_len()
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

impl Assembler for TcpAssembler {
    fn len(&self) -> usize {
        self.hlen() + self.data.len()
    }

    fn proto(&self) -> u8 {
        super::PROTO_TCP
    }

    fn pshdr_sum(&self, src: IpAddr, dst: IpAddr) -> u32 {
        super::pseudo_header_sum(src, dst, super::PROTO_TCP, self.len())
    }

    fn assemble(&self, frame: &mut [u8], pshdr_sum: u32) {
        let hlen = self.hlen();
        codec::put_u16(frame, 0, self.sport);
        codec::put_u16(frame, 2, self.dport);
        codec::put_u32(frame, 4, self.seq);
        codec::put_u32(frame, 8, self.ack);
        frame[12] = ((hlen / 4) as u8) << 4;
        frame[13] = self.flags.to_byte();
        codec::put_u16(frame, 14, self.win);
        codec::put_u16(frame, 16, 0);
        codec::put_u16(frame, 18, self.urg);
        frame[TCP_HEADER_LEN..hlen].fill(OPT_EOL);
        let mut offset = TCP_HEADER_LEN;
        for option in &self.options {
            option.write(&mut frame[offset..]);
            offset += option.wire_len();
        }
        frame[hlen..hlen + self.data.len()].copy_from_slice(&self.data);
        let len = self.len();
        let cksum = codec::inet_cksum(&frame[..len], pshdr_sum);
        codec::put_u16(frame, 16, cksum);
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::pseudo_header_sum;
    use std::net::Ipv6Addr;

    fn pshdr(len: usize) -> u32 {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        pseudo_header_sum(IpAddr::V6(src), IpAddr::V6(dst), crate::proto::PROTO_TCP, len)
    }

    fn syn_segment() -> TcpAssembler {
        TcpAssembler::new(
            49152,
            443,
            0x01020304,
            0,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            64240,
            vec![TcpOption::Mss(1460), TcpOption::Nop, TcpOption::Wscale(7)],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn syn_with_options_round_trips() {
        let tcp = syn_segment();
        assert_eq!(tcp.hlen(), 28);
        let mut frame = vec![0u8; tcp.len()];
        let sum = pshdr(tcp.len());
        tcp.assemble(&mut frame, sum);
        let view = parse(&frame, sum).unwrap();
        assert_eq!(view.sport, 49152);
        assert_eq!(view.dport, 443);
        assert_eq!(view.seq, 0x01020304);
        assert!(view.flags.syn);
        assert!(!view.flags.ack);
        assert_eq!(view.mss, Some(1460));
        assert_eq!(view.wscale, Some(7));
        assert!(view.payload.is_empty());
    }

    #[test]
    fn payload_round_trips_and_checksum_detects_flip() {
        let tcp = TcpAssembler::new(
            1,
            2,
            10,
            20,
            TcpFlags {
                ack: true,
                psh: true,
                ..Default::default()
            },
            1024,
            vec![],
            b"hello tcp".to_vec(),
        )
        .unwrap();
        let mut frame = vec![0u8; tcp.len()];
        let sum = pshdr(tcp.len());
        tcp.assemble(&mut frame, sum);
        assert_eq!(parse(&frame, sum).unwrap().payload, b"hello tcp");
        frame[TCP_HEADER_LEN] ^= 0x80;
        assert!(matches!(parse(&frame, sum), Err(ParseError::BadChecksum)));
    }

    #[test]
    fn data_offset_beyond_segment_rejected() {
        let tcp = syn_segment();
        let mut frame = vec![0u8; tcp.len()];
        let sum = pshdr(tcp.len());
        tcp.assemble(&mut frame, sum);
        frame[12] = 0xF0; // 60-byte header claim on a 28-byte segment
        assert!(matches!(parse(&frame, sum), Err(ParseError::TooShort)));
    }

    #[test]
    fn truncated_option_is_unsupported() {
        // Hand-build: valid header claiming 24-byte hlen, MSS option cut short.
        let mut frame = vec![0u8; 24];
        frame[12] = 6 << 4;
        frame[20] = OPT_NOP;
        frame[21] = OPT_NOP;
        frame[22] = OPT_MSS;
        frame[23] = 4; // needs 4 bytes, only 2 remain
        let sum = pshdr(frame.len());
        let cksum = codec::inet_cksum(&frame, sum);
        codec::put_u16(&mut frame, 16, cksum);
        assert!(matches!(parse(&frame, sum), Err(ParseError::Unsupported)));
    }

    #[test]
    fn oversized_option_list_rejected_at_build() {
        let options = vec![TcpOption::Mss(1460); 12];
        let result = TcpAssembler::new(1, 2, 0, 0, TcpFlags::default(), 0, options, vec![]);
        assert!(matches!(result, Err(BuildError::FieldRange("options"))));
    }
}
