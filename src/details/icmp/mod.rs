//! Echo request/reply framing for ICMPv4 and ICMPv6.
//!
//! Packets are built fresh for every request and parsed fresh for every
//! received datagram; nothing is shared between the send and receive paths.

use crate::PingResult;
use std::net::IpAddr;

mod sequence_number;
mod v4;
mod v6;

pub(crate) use sequence_number::SequenceNumber;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IcmpFamily {
    V4,
    V6,
}

impl IcmpFamily {
    pub(crate) fn of(addr: &IpAddr) -> IcmpFamily {
        match addr {
            IpAddr::V4(_) => IcmpFamily::V4,
            IpAddr::V6(_) => IcmpFamily::V6,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EchoKind {
    Request,
    Reply,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct EchoPacket {
    pub kind: EchoKind,
    pub identifier: u16,
    pub sequence: SequenceNumber,
    pub payload: Vec<u8>,
    pub checksum_valid: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Decoded {
    Echo(EchoPacket),
    /// Any ICMP message that is not an echo request or reply.
    Other { icmp_type: u8 },
}

pub(crate) fn encode_echo_request(
    family: IcmpFamily,
    identifier: u16,
    sequence: SequenceNumber,
    payload: &[u8],
) -> PingResult<Vec<u8>> {
    match family {
        IcmpFamily::V4 => v4::encode_echo_request(identifier, sequence, payload),
        IcmpFamily::V6 => v6::encode_echo_request(identifier, sequence, payload),
    }
}

/// Fails with `PingError::MalformedPacket` on truncated or otherwise broken frames.
pub(crate) fn decode(family: IcmpFamily, buf: &[u8]) -> PingResult<Decoded> {
    match family {
        IcmpFamily::V4 => v4::decode(buf),
        IcmpFamily::V6 => v6::decode(buf),
    }
}
