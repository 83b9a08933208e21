use super::TSocket;
use crate::details::icmp::IcmpFamily;
use socket2::Type;
use std::net::IpAddr;
use std::{io, time::Duration};

/// Unprivileged ICMP socket (`SOCK_DGRAM`, `IPPROTO_ICMP`).
pub(crate) struct DgramSocket {
    socket: socket2::Socket,
    family: IcmpFamily,
}

impl DgramSocket {
    pub(crate) fn new(family: IcmpFamily, read_timeout: Duration) -> Result<Self, io::Error> {
        tracing::debug!(?family, "creating DgramSocket");
        let socket = super::open(family, Type::DGRAM, read_timeout)?;
        Ok(DgramSocket { socket, family })
    }
}

impl TSocket for DgramSocket {
    fn send_to(&self, buf: &[u8], addr: &socket2::SockAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        super::recv_into(&self.socket, buf)
    }

    fn set_ttl(&self, ttl: u8) -> io::Result<()> {
        super::set_hop_limit(&self.socket, self.family, ttl)
    }

    fn rewrites_identifier(&self) -> bool {
        true
    }
}
