use crate::details::icmp::{self, Decoded, EchoKind, IcmpFamily, SequenceNumber};
use crate::details::lock;
use crate::details::socket::TSocket;
use crate::{PingError, PingResult};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long one blocking receive may take before the halt channel is polled again.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// After this many receive errors in a row the socket is considered unusable.
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

const RECEIVE_BUFFER_SIZE: usize = 65_536;

/// The receiving side of a session, as seen by the transport.
pub(crate) trait ReplySink: Send + Sync {
    fn on_echo_reply(&self, sequence: SequenceNumber, receive_time: Instant);
    fn on_transport_error(&self, error: &PingError, is_fatal: bool);
}

pub(crate) type SocketFactory = Arc<dyn Fn(IcmpFamily) -> io::Result<Box<dyn TSocket>> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RouteOutcome {
    Delivered,
    UnknownSession,
    Malformed,
    /// Not an echo reply, e.g. our own request seen on a loopback raw socket.
    Ignored,
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) enum State {
    New,
    Receiving,
    Halted,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TransportStats {
    pub received: u64,
    pub delivered: u64,
    pub unknown_session: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    unknown_session: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One ICMP socket of one address family, shared by every session of that family.
///
/// Outgoing requests carry the identifier the session registered under; the
/// receive thread routes each echo reply to the sink registered under the
/// reply's identifier. Datagram sockets overwrite the identifier field, so
/// for them the identifier also travels in the first two payload bytes.
pub(crate) struct EchoTransport {
    family: IcmpFamily,
    socket: Box<dyn TSocket>,
    rewrites_identifier: bool,
    routes: Mutex<HashMap<u16, Arc<dyn ReplySink>>>,
    // last TTL applied to the socket
    send_lock: Mutex<Option<u8>>,
    counters: Counters,
    failed: AtomicBool,
    states: Mutex<Vec<State>>,
    halt_tx: Mutex<Option<mpsc::Sender<()>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EchoTransport {
    pub(crate) fn new(socket: Box<dyn TSocket>, family: IcmpFamily) -> Self {
        EchoTransport {
            family,
            rewrites_identifier: socket.rewrites_identifier(),
            socket,
            routes: Mutex::new(HashMap::new()),
            send_lock: Mutex::new(None),
            counters: Counters::default(),
            failed: AtomicBool::new(false),
            states: Mutex::new(vec![State::New]),
            halt_tx: Mutex::new(None),
            thread_handle: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn get_states(&self) -> Vec<State> {
        lock(&self.states).clone()
    }

    pub(crate) fn start(self: &Arc<Self>) -> PingResult<()> {
        let mut states = lock(&self.states);
        if states.last() != Some(&State::New) {
            return Ok(());
        }

        let (halt_tx, halt_rx) = mpsc::channel::<()>();
        let transport = self.clone();
        let handle = thread::Builder::new()
            .name(format!("pinger-receive-{:?}", self.family).to_lowercase())
            .spawn(move || transport.receive_loop(&halt_rx))
            .map_err(|e| PingError::Transport(format!("cannot spawn receive thread: {e}")))?;

        *lock(&self.halt_tx) = Some(halt_tx);
        *lock(&self.thread_handle) = Some(handle);
        states.push(State::Receiving);
        tracing::debug!(family = ?self.family, "transport receiving");
        Ok(())
    }

    pub(crate) fn halt(&self) {
        let mut states = lock(&self.states);
        if states.last() == Some(&State::Halted) {
            return;
        }
        states.push(State::Halted);
        drop(states);

        if let Some(halt_tx) = lock(&self.halt_tx).take() {
            let _ = halt_tx.send(());
        }
        let handle = lock(&self.thread_handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // halted from a sink callback; the loop sees the halt on its next turn
            } else if handle.join().is_err() {
                tracing::warn!(family = ?self.family, "receive thread panicked");
            }
        }
        tracing::debug!(family = ?self.family, stats = ?self.stats(), "transport halted");
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn family(&self) -> IcmpFamily {
        self.family
    }

    /// Routes replies carrying the returned identifier to `sink`.
    pub(crate) fn register(&self, sink: Arc<dyn ReplySink>) -> PingResult<u16> {
        let mut routes = lock(&self.routes);
        let base: u16 = rand::random();
        let identifier = (0..=u16::MAX)
            .map(|offset| base.wrapping_add(offset))
            .find(|identifier| !routes.contains_key(identifier))
            .ok_or_else(|| PingError::Transport("no free echo identifier".to_owned()))?;
        routes.insert(identifier, sink);
        tracing::trace!(family = ?self.family, identifier, "registered");
        Ok(identifier)
    }

    pub(crate) fn unregister(&self, identifier: u16) {
        if lock(&self.routes).remove(&identifier).is_some() {
            tracing::trace!(family = ?self.family, identifier, "unregistered");
        }
    }

    pub(crate) fn send(
        &self,
        addr: IpAddr,
        identifier: u16,
        sequence: SequenceNumber,
        payload: &[u8],
        ttl: u8,
    ) -> PingResult<()> {
        let packet = if self.rewrites_identifier {
            let mut tagged = payload.to_vec();
            if tagged.len() < 2 {
                tagged.resize(2, 0);
            }
            tagged[..2].copy_from_slice(&identifier.to_be_bytes());
            icmp::encode_echo_request(self.family, identifier, sequence, &tagged)?
        } else {
            icmp::encode_echo_request(self.family, identifier, sequence, payload)?
        };
        let sock_addr = socket2::SockAddr::from(SocketAddr::new(addr, 0));

        let result = {
            let mut last_ttl = lock(&self.send_lock);
            if *last_ttl != Some(ttl) {
                self.socket
                    .set_ttl(ttl)
                    .map_err(|e| PingError::SendFailed(format!("cannot set ttl {ttl}: {e}")))?;
                *last_ttl = Some(ttl);
            }
            self.socket.send_to(&packet, &sock_addr)
        };
        match result {
            Ok(n) if n == packet.len() => {
                tracing::trace!(%addr, identifier, %sequence, "echo request sent");
                Ok(())
            }
            Ok(n) => {
                bump(&self.counters.send_errors);
                Err(PingError::SendFailed(format!("sent {n} of {} bytes", packet.len())))
            }
            Err(e) => {
                bump(&self.counters.send_errors);
                Err(PingError::SendFailed(e.to_string()))
            }
        }
    }

    pub(crate) fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            unknown_session: c.unknown_session.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            receive_errors: c.receive_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn route_datagram(&self, buf: &[u8], source: IpAddr, receive_time: Instant) -> RouteOutcome {
        bump(&self.counters.received);
        let packet = match icmp::decode(self.family, buf) {
            Ok(Decoded::Echo(packet)) if packet.kind == EchoKind::Reply => packet,
            Ok(Decoded::Echo(_)) => {
                bump(&self.counters.ignored);
                return RouteOutcome::Ignored;
            }
            Ok(Decoded::Other { icmp_type }) => {
                tracing::trace!(%source, icmp_type, "ignoring ICMP message");
                bump(&self.counters.ignored);
                return RouteOutcome::Ignored;
            }
            Err(e) => {
                tracing::trace!(%source, "dropping datagram: {e}");
                bump(&self.counters.malformed);
                return RouteOutcome::Malformed;
            }
        };
        if !packet.checksum_valid {
            tracing::trace!(%source, "dropping echo reply with bad checksum");
            bump(&self.counters.malformed);
            return RouteOutcome::Malformed;
        }

        let identifier = if self.rewrites_identifier {
            match packet.payload.get(..2) {
                Some(tag) => u16::from_be_bytes([tag[0], tag[1]]),
                None => {
                    tracing::trace!(%source, "dropping echo reply without identifier tag");
                    bump(&self.counters.malformed);
                    return RouteOutcome::Malformed;
                }
            }
        } else {
            packet.identifier
        };

        let sink = lock(&self.routes).get(&identifier).cloned();
        match sink {
            Some(sink) => {
                tracing::trace!(%source, identifier, sequence = %packet.sequence, "echo reply routed");
                sink.on_echo_reply(packet.sequence, receive_time);
                bump(&self.counters.delivered);
                RouteOutcome::Delivered
            }
            None => {
                tracing::trace!(%source, "dropping echo reply: {}", PingError::UnknownSession(identifier));
                bump(&self.counters.unknown_session);
                RouteOutcome::UnknownSession
            }
        }
    }

    fn receive_loop(&self, halt_rx: &mpsc::Receiver<()>) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let mut consecutive_errors = 0;
        loop {
            match halt_rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            match self.socket.recv_from(&mut buf) {
                Ok((n, source)) => {
                    consecutive_errors = 0;
                    self.route_datagram(&buf[..n], source, Instant::now());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    bump(&self.counters.receive_errors);
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(family = ?self.family, "giving up after {consecutive_errors} receive errors: {e}");
                        self.failed.store(true, Ordering::Release);
                        self.notify_sinks(&PingError::Transport(format!("socket unusable: {e}")), true);
                        break;
                    }
                    tracing::warn!(family = ?self.family, "receive error: {e}");
                    if consecutive_errors == 1 {
                        self.notify_sinks(&PingError::from(e), false);
                    }
                }
            }
        }
        tracing::debug!(family = ?self.family, "receive loop finished");
    }

    fn notify_sinks(&self, error: &PingError, is_fatal: bool) {
        let sinks: Vec<Arc<dyn ReplySink>> = lock(&self.routes).values().cloned().collect();
        for sink in sinks {
            sink.on_transport_error(error, is_fatal);
        }
    }
}

/// Opens transports lazily, one per address family, and hands out shared references.
pub(crate) struct TransportPool {
    factory: SocketFactory,
    transports: Mutex<HashMap<IcmpFamily, Arc<EchoTransport>>>,
    // set by `halt_all`, read and written under the `transports` lock
    closed: AtomicBool,
}

impl TransportPool {
    pub(crate) fn new(factory: SocketFactory) -> Self {
        TransportPool { factory, transports: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// A failed transport is replaced by a fresh one. Fails once the pool is halted.
    pub(crate) fn acquire(&self, family: IcmpFamily) -> PingResult<Arc<EchoTransport>> {
        let mut transports = lock(&self.transports);
        if self.closed.load(Ordering::Acquire) {
            return Err(PingError::Transport("engine is shut down".to_owned()));
        }
        if let Some(transport) = transports.get(&family) {
            if !transport.is_failed() {
                return Ok(transport.clone());
            }
        }

        let socket = (self.factory)(family)
            .map_err(|e| PingError::Transport(format!("cannot open {family:?} ICMP socket: {e}")))?;
        let transport = Arc::new(EchoTransport::new(socket, family));
        transport.start()?;
        tracing::debug!(?family, "opened transport");
        let replaced = transports.insert(family, transport.clone());
        drop(transports);
        if let Some(old) = replaced {
            old.halt();
        }
        Ok(transport)
    }

    #[cfg(test)]
    pub(crate) fn stats(&self, family: IcmpFamily) -> Option<TransportStats> {
        lock(&self.transports).get(&family).map(|transport| transport.stats())
    }

    pub(crate) fn halt_all(&self) {
        let transports: Vec<Arc<EchoTransport>> = {
            let mut transports = lock(&self.transports);
            self.closed.store(true, Ordering::Release);
            transports.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::details::socket::tests::{OnReceive, OnSend, SocketMock};

    use pnet_packet::icmp::{checksum, IcmpPacket};
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[derive(Default)]
    struct RecordingSink {
        replies: Mutex<Vec<u16>>,
        errors: Mutex<Vec<(PingError, bool)>>,
    }

    impl ReplySink for RecordingSink {
        fn on_echo_reply(&self, sequence: SequenceNumber, _receive_time: Instant) {
            self.replies.lock().unwrap().push(sequence.into());
        }

        fn on_transport_error(&self, error: &PingError, is_fatal: bool) {
            self.errors.lock().unwrap().push((error.clone(), is_fatal));
        }
    }

    struct FailingSocket;

    impl TSocket for FailingSocket {
        fn send_to(&self, buf: &[u8], _addr: &socket2::SockAddr) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
            Err(io::Error::new(io::ErrorKind::Other, "simulating broken socket"))
        }

        fn set_ttl(&self, _ttl: u8) -> io::Result<()> {
            Ok(())
        }

        fn rewrites_identifier(&self) -> bool {
            false
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn reply_frame(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame =
            icmp::encode_echo_request(IcmpFamily::V4, identifier, SequenceNumber::from(sequence), payload).unwrap();
        frame[0] = 0;
        frame[2..4].copy_from_slice(&[0, 0]);
        let sum = checksum(&IcmpPacket::new(&frame).unwrap());
        frame[2..4].copy_from_slice(&sum.to_be_bytes());
        frame
    }

    fn transport_with(mock: &SocketMock) -> Arc<EchoTransport> {
        Arc::new(EchoTransport::new(Box::new(mock.clone()), IcmpFamily::V4))
    }

    #[test]
    fn test_states() {
        let transport = transport_with(&SocketMock::new_default());
        assert_eq!(vec![State::New], transport.get_states());

        transport.start().unwrap();
        assert_eq!(vec![State::New, State::Receiving], transport.get_states());

        transport.halt();
        transport.halt();
        assert_eq!(vec![State::New, State::Receiving, State::Halted], transport.get_states());
    }

    #[test]
    fn register_hands_out_distinct_identifiers() {
        let transport = transport_with(&SocketMock::new_default());
        let sink = Arc::new(RecordingSink::default());

        let a = transport.register(sink.clone()).unwrap();
        let b = transport.register(sink.clone()).unwrap();
        assert_ne!(a, b);

        transport.unregister(a);
        let outcome = transport.route_datagram(&reply_frame(a, 1, &[1, 2]), LOCALHOST, Instant::now());
        assert_eq!(RouteOutcome::UnknownSession, outcome);
    }

    #[test]
    fn echo_reply_reaches_registered_sink() {
        let mock = SocketMock::new_default();
        let transport = transport_with(&mock);
        let sink = Arc::new(RecordingSink::default());
        let identifier = transport.register(sink.clone()).unwrap();
        transport.start().unwrap();

        transport.send(LOCALHOST, identifier, SequenceNumber::from(1), &[9; 8], 64).unwrap();
        transport.send(LOCALHOST, identifier, SequenceNumber::from(2), &[9; 8], 64).unwrap();
        wait_for(|| sink.replies.lock().unwrap().len() == 2);
        transport.halt();

        mock.should_send_number_of_messages(2).should_send_to_address(&LOCALHOST);
        assert_eq!(vec![1, 2], *sink.replies.lock().unwrap());
        assert_eq!(2, transport.stats().delivered);
    }

    #[test]
    fn unknown_identifier_is_dropped() {
        let transport = transport_with(&SocketMock::new(OnSend::ReturnDefault, OnReceive::Silent));
        let sink = Arc::new(RecordingSink::default());
        let identifier = transport.register(sink.clone()).unwrap();

        let outcome = transport.route_datagram(
            &reply_frame(identifier.wrapping_add(1), 1, &[]),
            LOCALHOST,
            Instant::now(),
        );

        assert_eq!(RouteOutcome::UnknownSession, outcome);
        assert!(sink.replies.lock().unwrap().is_empty());
        assert_eq!(1, transport.stats().unknown_session);
    }

    #[test]
    fn malformed_datagrams_are_counted() {
        let transport = transport_with(&SocketMock::new(OnSend::ReturnDefault, OnReceive::Silent));
        let identifier = transport.register(Arc::new(RecordingSink::default())).unwrap();

        let truncated = transport.route_datagram(&[0, 0, 0], LOCALHOST, Instant::now());
        let mut corrupted = reply_frame(identifier, 1, &[1, 2, 3]);
        corrupted[9] ^= 0xff;
        let bad_checksum = transport.route_datagram(&corrupted, LOCALHOST, Instant::now());

        assert_eq!(RouteOutcome::Malformed, truncated);
        assert_eq!(RouteOutcome::Malformed, bad_checksum);
        let stats = transport.stats();
        assert_eq!(2, stats.malformed);
        assert_eq!(2, stats.received);
    }

    #[test]
    fn echo_requests_are_ignored() {
        let transport = transport_with(&SocketMock::new(OnSend::ReturnDefault, OnReceive::Silent));
        let sink = Arc::new(RecordingSink::default());
        let identifier = transport.register(sink.clone()).unwrap();
        let request = icmp::encode_echo_request(IcmpFamily::V4, identifier, SequenceNumber::from(1), &[]).unwrap();

        let outcome = transport.route_datagram(&request, LOCALHOST, Instant::now());

        assert_eq!(RouteOutcome::Ignored, outcome);
        assert!(sink.replies.lock().unwrap().is_empty());
    }

    #[test]
    fn rewriting_socket_routes_by_payload_tag() {
        let mock = SocketMock::new_default().rewriting_identifier();
        let transport = transport_with(&mock);
        let sink = Arc::new(RecordingSink::default());
        let identifier = transport.register(sink.clone()).unwrap();
        transport.start().unwrap();

        transport.send(LOCALHOST, identifier, SequenceNumber::from(5), &[], 64).unwrap();
        wait_for(|| !sink.replies.lock().unwrap().is_empty());
        transport.halt();

        // the identifier field of the reply was rewritten, the tag was not
        let (frame, _) = mock.sent_frames().remove(0);
        assert_eq!(8 + 2, frame.len());
        assert_eq!(identifier.to_be_bytes(), frame[8..10]);
        assert_eq!(vec![5], *sink.replies.lock().unwrap());
    }

    #[test]
    fn ttl_is_applied_only_when_it_changes() {
        let mock = SocketMock::new(OnSend::ReturnDefault, OnReceive::Silent);
        let transport = transport_with(&mock);

        transport.send(LOCALHOST, 1, SequenceNumber::from(1), &[], 5).unwrap();
        transport.send(LOCALHOST, 2, SequenceNumber::from(1), &[], 5).unwrap();
        transport.send(LOCALHOST, 3, SequenceNumber::from(1), &[], 7).unwrap();

        assert_eq!(vec![5, 7], mock.ttls());
    }

    #[test]
    fn send_failure_is_reported() {
        let mock = SocketMock::new(OnSend::ReturnErr, OnReceive::Silent);
        let transport = transport_with(&mock);

        let result = transport.send(LOCALHOST, 1, SequenceNumber::from(1), &[], 5);

        assert!(matches!(result, Err(PingError::SendFailed(_))));
        assert_eq!(1, transport.stats().send_errors);
    }

    #[test]
    fn broken_socket_fails_transport() {
        let transport = Arc::new(EchoTransport::new(Box::new(FailingSocket), IcmpFamily::V4));
        let sink = Arc::new(RecordingSink::default());
        transport.register(sink.clone()).unwrap();
        transport.start().unwrap();

        wait_for(|| transport.is_failed());
        transport.halt();

        let errors = sink.errors.lock().unwrap().clone();
        assert_eq!(2, errors.len());
        assert!(matches!(errors[0], (PingError::Io(_), false)));
        assert!(matches!(errors[1], (PingError::Transport(_), true)));
        assert_eq!(u64::from(MAX_CONSECUTIVE_ERRORS), transport.stats().receive_errors);
    }

    #[test]
    fn pool_shares_transport_per_family() {
        let mock = SocketMock::new_default();
        let factory_mock = mock.clone();
        let pool = TransportPool::new(Arc::new(move |_family: IcmpFamily| -> io::Result<Box<dyn TSocket>> {
            Ok(Box::new(factory_mock.clone()))
        }));

        let a = pool.acquire(IcmpFamily::V4).unwrap();
        let b = pool.acquire(IcmpFamily::V4).unwrap();
        let c = pool.acquire(IcmpFamily::V6).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(IcmpFamily::V6, c.family());
        assert_eq!(Some(TransportStats::default()), pool.stats(IcmpFamily::V4));
        pool.halt_all();
        assert_eq!(Some(&State::Halted), a.get_states().last());
        assert_eq!(None, pool.stats(IcmpFamily::V4));
    }

    #[test]
    fn pool_reports_socket_creation_failure() {
        let pool = TransportPool::new(Arc::new(|_family: IcmpFamily| -> io::Result<Box<dyn TSocket>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }));

        assert!(matches!(pool.acquire(IcmpFamily::V4), Err(PingError::Transport(_))));
    }

    #[test]
    fn halted_pool_opens_no_more_sockets() {
        let opened = Arc::new(AtomicU64::new(0));
        let counter = opened.clone();
        let pool = TransportPool::new(Arc::new(move |_family: IcmpFamily| -> io::Result<Box<dyn TSocket>> {
            bump(&counter);
            Ok(Box::new(SocketMock::new_default()))
        }));
        pool.acquire(IcmpFamily::V4).unwrap();

        pool.halt_all();

        assert!(matches!(pool.acquire(IcmpFamily::V4), Err(PingError::Transport(_))));
        assert!(matches!(pool.acquire(IcmpFamily::V6), Err(PingError::Transport(_))));
        assert_eq!(1, opened.load(Ordering::Relaxed));
    }
}
