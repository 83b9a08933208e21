use super::{Decoded, EchoKind, EchoPacket, SequenceNumber};
use crate::{PingError, PingResult};
use pnet_packet::icmp::{
    echo_reply::EchoReplyPacket,
    echo_request::{EchoRequestPacket as EchoRequestPacketV4, MutableEchoRequestPacket as MutableEchoRequestPacketV4},
    IcmpCode, IcmpPacket, IcmpTypes,
};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::{Packet, PrimitiveValues};

pub(super) fn encode_echo_request(identifier: u16, sequence: SequenceNumber, payload: &[u8]) -> PingResult<Vec<u8>> {
    let buf = vec![0u8; EchoRequestPacketV4::minimum_packet_size() + payload.len()];
    let mut package = MutableEchoRequestPacketV4::owned(buf)
        .ok_or_else(|| PingError::MalformedPacket("could not create ICMP package".to_owned()))?;
    package.set_icmp_type(IcmpTypes::EchoRequest);
    package.set_icmp_code(IcmpCode::new(0));
    package.set_identifier(identifier);
    package.set_sequence_number(sequence.into());
    package.set_payload(payload);

    package.set_checksum(0_u16);
    let checksum = IcmpPacket::new(package.packet())
        .map(|icmp| pnet_packet::icmp::checksum(&icmp))
        .ok_or_else(|| PingError::MalformedPacket("could not compute checksum".to_owned()))?;
    package.set_checksum(checksum);
    Ok(package.packet().to_vec())
}

pub(super) fn decode(buf: &[u8]) -> PingResult<Decoded> {
    let icmp_bytes = strip_ipv4_header(buf)?;
    let icmp = IcmpPacket::new(icmp_bytes)
        .ok_or_else(|| PingError::MalformedPacket(format!("{} bytes are too short for ICMP", icmp_bytes.len())))?;
    let icmp_type = icmp.get_icmp_type();
    let kind = if icmp_type == IcmpTypes::EchoReply {
        EchoKind::Reply
    } else if icmp_type == IcmpTypes::EchoRequest {
        EchoKind::Request
    } else {
        return Ok(Decoded::Other { icmp_type: icmp_type.to_primitive_values().0 });
    };

    // Echo request and echo reply share the same layout.
    let echo = EchoReplyPacket::new(icmp_bytes)
        .ok_or_else(|| PingError::MalformedPacket(format!("{} bytes are too short for echo", icmp_bytes.len())))?;
    let checksum_valid = pnet_packet::icmp::checksum(&icmp) == icmp.get_checksum();
    Ok(Decoded::Echo(EchoPacket {
        kind,
        identifier: echo.get_identifier(),
        sequence: echo.get_sequence_number().into(),
        payload: echo.payload().to_vec(),
        checksum_valid,
    }))
}

// Raw IPv4 sockets (and datagram sockets on some platforms) hand out the whole
// IP packet. ICMP never starts with a version nibble of 4, so this is unambiguous.
fn strip_ipv4_header(buf: &[u8]) -> PingResult<&[u8]> {
    match buf.first() {
        Some(first) if first >> 4 == 4 => {
            let ipv4_packet = Ipv4Packet::new(buf)
                .ok_or_else(|| PingError::MalformedPacket("truncated IPv4 header".to_owned()))?;
            let header_len = usize::from(ipv4_packet.get_header_length()) * 4;
            if header_len < Ipv4Packet::minimum_packet_size() || header_len > buf.len() {
                return Err(PingError::MalformedPacket(format!("bad IPv4 header length {header_len}")));
            }
            Ok(&buf[header_len..])
        }
        _ => Ok(buf),
    }
}
