//! ARP over Ethernet/IPv4 (RFC 826).

use super::ether::MacAddr;
use super::{Assembler, BuildError, ParseError};
use crate::codec;
use crate::tracker::{Tracker, TrackerPrefix};
use std::net::Ipv4Addr;

pub const ARP_HEADER_LEN: usize = 28;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

const HRD_ETHERNET: u16 = 1;
const PRO_IP4: u16 = 0x0800;

/// Parsed view of an ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpView {
    pub oper: u16,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

pub fn parse(frame: &[u8]) -> Result<ArpView, ParseError> {
    if frame.len() < ARP_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    if codec::get_u16(frame, 0) != HRD_ETHERNET || codec::get_u16(frame, 2) != PRO_IP4 {
        return Err(ParseError::Unsupported);
    }
    // hln/pln fixed by the hardware/protocol pair above
    if frame[4] != 6 || frame[5] != 4 {
        return Err(ParseError::Unsupported);
    }
    let oper = codec::get_u16(frame, 6);
    if oper != ARP_OP_REQUEST && oper != ARP_OP_REPLY {
        return Err(ParseError::Unsupported);
    }
    let mut sha = [0u8; 6];
    sha.copy_from_slice(&frame[8..14]);
    let mut tha = [0u8; 6];
    tha.copy_from_slice(&frame[18..24]);
    Ok(ArpView {
        oper,
        sha: MacAddr(sha),
        spa: Ipv4Addr::new(frame[14], frame[15], frame[16], frame[17]),
        tha: MacAddr(tha),
        tpa: Ipv4Addr::new(frame[24], frame[25], frame[26], frame[27]),
    })
}

/// Outbound ARP request or reply.
pub struct ArpAssembler {
    oper: u16,
    sha: MacAddr,
    spa: Ipv4Addr,
    tha: MacAddr,
    tpa: Ipv4Addr,
    tracker: Tracker,
}

impl ArpAssembler {
    pub fn new(
        oper: u16,
        sha: MacAddr,
        spa: Ipv4Addr,
        tha: MacAddr,
        tpa: Ipv4Addr,
        echo_tracker: Option<&Tracker>,
    ) -> Result<Self, BuildError> {
        if oper != ARP_OP_REQUEST && oper != ARP_OP_REPLY {
            return Err(BuildError::FieldRange("oper"));
        }
        let tracker = match echo_tracker {
            Some(echo) => Tracker::new_echo(TrackerPrefix::Tx, echo),
            None => Tracker::new(TrackerPrefix::Tx),
        };
        Ok(Self {
            oper,
            sha,
            spa,
            tha,
            tpa,
            tracker,
        })
    }

    pub fn request(sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Self {
        // Fields are statically valid, construction cannot fail.
        Self::new(ARP_OP_REQUEST, sha, spa, MacAddr::UNSPECIFIED, tpa, None)
            .expect("static arp request fields")
    }

    pub fn oper(&self) -> u16 {
        self.oper
    }
}

impl Assembler for ArpAssembler {
    fn len(&self) -> usize {
        ARP_HEADER_LEN
    }

    fn proto(&self) -> u8 {
        0
    }

    fn assemble(&self, frame: &mut [u8], _pshdr_sum: u32) {
        codec::put_u16(frame, 0, HRD_ETHERNET);
        codec::put_u16(frame, 2, PRO_IP4);
        frame[4] = 6;
        frame[5] = 4;
        codec::put_u16(frame, 6, self.oper);
        frame[8..14].copy_from_slice(&self.sha.0);
        frame[14..18].copy_from_slice(&self.spa.octets());
        frame[18..24].copy_from_slice(&self.tha.0);
        frame[24..28].copy_from_slice(&self.tpa.octets());
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> ArpAssembler {
        ArpAssembler::new(
            ARP_OP_REPLY,
            MacAddr([0x02, 0, 0, 0, 0, 0x0A]),
            Ipv4Addr::new(192, 168, 9, 7),
            MacAddr([0x02, 0, 0, 0, 0, 0x0B]),
            Ipv4Addr::new(192, 168, 9, 102),
            None,
        )
        .unwrap()
    }

    #[test]
    fn assemble_parse_round_trip() {
        let arp = sample_reply();
        let mut buf = vec![0u8; arp.len()];
        arp.assemble(&mut buf, 0);
        let view = parse(&buf).unwrap();
        assert_eq!(view.oper, ARP_OP_REPLY);
        assert_eq!(view.spa, Ipv4Addr::new(192, 168, 9, 7));
        assert_eq!(view.tpa, Ipv4Addr::new(192, 168, 9, 102));
        assert_eq!(view.sha, MacAddr([0x02, 0, 0, 0, 0, 0x0A]));
    }

    #[test]
    fn parse_rejects_non_ethernet_hardware() {
        let arp = sample_reply();
        let mut buf = vec![0u8; arp.len()];
        arp.assemble(&mut buf, 0);
        codec::put_u16(&mut buf, 0, 6);
        assert_eq!(parse(&buf), Err(ParseError::Unsupported));
    }

    #[test]
    fn parse_rejects_unknown_operation() {
        let arp = sample_reply();
        let mut buf = vec![0u8; arp.len()];
        arp.assemble(&mut buf, 0);
        codec::put_u16(&mut buf, 6, 9);
        assert_eq!(parse(&buf), Err(ParseError::Unsupported));
    }

    #[test]
    fn build_rejects_bad_operation() {
        let result = ArpAssembler::new(
            3,
            MacAddr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            MacAddr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            None,
        );
        assert_eq!(result.err(), Some(BuildError::FieldRange("oper")));
    }

    #[test]
    fn request_targets_unspecified_hardware() {
        let arp = ArpAssembler::request(
            MacAddr([0x02, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let mut buf = vec![0u8; arp.len()];
        arp.assemble(&mut buf, 0);
        let view = parse(&buf).unwrap();
        assert_eq!(view.oper, ARP_OP_REQUEST);
        assert!(view.tha.is_unspecified());
    }
}
