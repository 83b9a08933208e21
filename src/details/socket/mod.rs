use crate::details::icmp::IcmpFamily;
use crate::SocketType;
use socket2::{Domain, Protocol, Type};
use std::net::IpAddr;
use std::{io, time::Duration};

pub(crate) use dgram_socket::DgramSocket;
pub(crate) use raw_socket::RawSocket;

mod dgram_socket;
mod raw_socket;

// A send that cannot complete in this time fails instead of stalling its session.
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) trait TSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: &socket2::SockAddr) -> io::Result<usize>;
    /// Receives one datagram. Times out with `WouldBlock` or `TimedOut`.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)>;
    fn set_ttl(&self, ttl: u8) -> io::Result<()>;
    /// Datagram ICMP sockets replace the echo identifier with their own.
    fn rewrites_identifier(&self) -> bool;
}

pub(crate) enum Socket {
    Raw(RawSocket),
    Dgram(DgramSocket),
}

impl Socket {
    pub(crate) fn new(socket_type: SocketType, family: IcmpFamily, read_timeout: Duration) -> Result<Self, io::Error> {
        match socket_type {
            SocketType::Dgram => Ok(Socket::Dgram(DgramSocket::new(family, read_timeout)?)),
            SocketType::Raw => Ok(Socket::Raw(RawSocket::new(family, read_timeout)?)),
        }
    }
}

impl TSocket for Socket {
    fn send_to(&self, buf: &[u8], addr: &socket2::SockAddr) -> io::Result<usize> {
        match self {
            Socket::Dgram(socket) => socket.send_to(buf, addr),
            Socket::Raw(socket) => socket.send_to(buf, addr),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        match self {
            Socket::Dgram(socket) => socket.recv_from(buf),
            Socket::Raw(socket) => socket.recv_from(buf),
        }
    }

    fn set_ttl(&self, ttl: u8) -> io::Result<()> {
        match self {
            Socket::Dgram(socket) => socket.set_ttl(ttl),
            Socket::Raw(socket) => socket.set_ttl(ttl),
        }
    }

    fn rewrites_identifier(&self) -> bool {
        match self {
            Socket::Dgram(socket) => socket.rewrites_identifier(),
            Socket::Raw(socket) => socket.rewrites_identifier(),
        }
    }
}

fn open(family: IcmpFamily, socket_type: Type, read_timeout: Duration) -> io::Result<socket2::Socket> {
    let (domain, protocol) = match family {
        IcmpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IcmpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = socket2::Socket::new(domain, socket_type, Some(protocol))?;
    set_timeouts(&socket, read_timeout)?;
    Ok(socket)
}

fn set_timeouts(socket: &socket2::Socket, read_timeout: Duration) -> io::Result<()> {
    socket.set_read_timeout(Some(read_timeout))?;
    socket.set_write_timeout(Some(WRITE_TIMEOUT))
}

fn set_hop_limit(socket: &socket2::Socket, family: IcmpFamily, ttl: u8) -> io::Result<()> {
    match family {
        IcmpFamily::V4 => socket.set_ttl(u32::from(ttl)),
        IcmpFamily::V6 => socket.set_unicast_hops_v6(u32::from(ttl)),
    }
}

fn recv_into(socket: &socket2::Socket, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
    // Socket2 gives a safety guaranty which allows us to do an unsafe cast from `&mut [u8]`
    // to `&mut [std::mem::MaybeUninit<u8>]`: it never writes uninitialised bytes.
    // https://docs.rs/socket2/0.4.7/socket2/struct.Socket.html#method.recv
    let (n, socket_addr) =
        socket.recv_from(unsafe { &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>]) })?;
    let ip = socket_addr
        .as_socket()
        .map(|addr| addr.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "datagram without IP source address"))?;
    Ok((n, ip))
}
