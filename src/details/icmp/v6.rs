use super::{Decoded, EchoKind, EchoPacket, SequenceNumber};
use crate::{PingError, PingResult};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet_packet::{Packet, PrimitiveValues};

// identifier + sequence number, in front of the echo data
const ECHO_FIELDS_SIZE: usize = 4;

pub(super) fn encode_echo_request(identifier: u16, sequence: SequenceNumber, payload: &[u8]) -> PingResult<Vec<u8>> {
    let mut body = Vec::with_capacity(ECHO_FIELDS_SIZE + payload.len());
    body.extend_from_slice(&identifier.to_be_bytes());
    body.extend_from_slice(&u16::from(sequence).to_be_bytes());
    body.extend_from_slice(payload);

    let buf = vec![0u8; Icmpv6Packet::minimum_packet_size() + body.len()];
    let mut package = MutableIcmpv6Packet::owned(buf)
        .ok_or_else(|| PingError::MalformedPacket("could not create ICMPv6 package".to_owned()))?;
    package.set_icmpv6_type(Icmpv6Types::EchoRequest);
    package.set_icmpv6_code(Icmpv6Code::new(0));
    // The checksum covers the IPv6 pseudo header; the kernel fills it in.
    package.set_checksum(0_u16);
    package.set_payload(&body);
    Ok(package.packet().to_vec())
}

pub(super) fn decode(buf: &[u8]) -> PingResult<Decoded> {
    let icmp = Icmpv6Packet::new(buf)
        .ok_or_else(|| PingError::MalformedPacket(format!("{} bytes are too short for ICMPv6", buf.len())))?;
    let icmp_type = icmp.get_icmpv6_type();
    let kind = if icmp_type == Icmpv6Types::EchoReply {
        EchoKind::Reply
    } else if icmp_type == Icmpv6Types::EchoRequest {
        EchoKind::Request
    } else {
        return Ok(Decoded::Other { icmp_type: icmp_type.to_primitive_values().0 });
    };

    let body = icmp.payload();
    if body.len() < ECHO_FIELDS_SIZE {
        return Err(PingError::MalformedPacket(format!("{} bytes are too short for echo", buf.len())));
    }
    Ok(Decoded::Echo(EchoPacket {
        kind,
        identifier: u16::from_be_bytes([body[0], body[1]]),
        sequence: u16::from_be_bytes([body[2], body[3]]).into(),
        payload: body[ECHO_FIELDS_SIZE..].to_vec(),
        // Verified by the kernel before delivery, we lack the pseudo header here.
        checksum_valid: true,
    }))
}
