use crate::details::dispatcher::Dispatcher;
use crate::details::icmp::IcmpFamily;
use crate::details::lock;
use crate::details::session::{Session, StopCause};
use crate::details::socket::{Socket, TSocket};
use crate::details::transport::{self, SocketFactory, TransportPool};
use crate::{PingConfig, PingError, PingId, PingListener, PingResult};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

// Ids are unique across all engines of the process.
static NEXT_PING_ID: AtomicU32 = AtomicU32::new(1);

/// The kind of ICMP socket an engine opens.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SocketType {
    /// Unprivileged ICMP datagram sockets (`net.ipv4.ping_group_range` on Linux).
    #[default]
    Dgram,
    /// Raw sockets; need root or `CAP_NET_RAW`.
    Raw,
}

/// Runs any number of concurrent ping sessions and reports their progress to
/// one `PingListener`.
///
/// Dropping the engine stops all sessions; their `Stop` events are still
/// delivered before the listener is dropped.
///
/// ```no_run
/// use pinger::{ChannelListener, PingConfig, PingEvent, Pinger};
///
/// let (listener, events) = ChannelListener::new();
/// let pinger = Pinger::new(listener)?;
/// let id = pinger.start("localhost", PingConfig { max_sequence: 4, ..PingConfig::default() })?;
/// for event in events {
///     println!("{event:?}");
///     if matches!(event, PingEvent::Stop(_)) {
///         break;
///     }
/// }
/// pinger.stop(id);
/// # Ok::<(), pinger::PingError>(())
/// ```
pub struct Pinger {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    sessions: Mutex<HashMap<PingId, Arc<Session>>>,
    transports: Arc<TransportPool>,
    dispatcher: Dispatcher,
}

/// Non-owning reference to a `Pinger`. Every operation is a no-op once the
/// engine is gone.
#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct PingerHandle {
    inner: Weak<Inner>,
}

impl Pinger {
    pub fn new(listener: impl PingListener + 'static) -> PingResult<Pinger> {
        Self::with_socket_type(listener, SocketType::default())
    }

    pub fn with_socket_type(listener: impl PingListener + 'static, socket_type: SocketType) -> PingResult<Pinger> {
        let factory: SocketFactory = Arc::new(move |family: IcmpFamily| -> io::Result<Box<dyn TSocket>> {
            let socket = Socket::new(socket_type, family, transport::READ_TIMEOUT)?;
            tracing::debug!(?socket_type, ?family, "socket created");
            Ok(Box::new(socket))
        });
        Self::with_socket_factory(Box::new(listener), factory)
    }

    pub(crate) fn with_socket_factory(listener: Box<dyn PingListener>, factory: SocketFactory) -> PingResult<Pinger> {
        let inner = Inner {
            sessions: Mutex::new(HashMap::new()),
            transports: Arc::new(TransportPool::new(factory)),
            dispatcher: Dispatcher::start(listener)?,
        };
        Ok(Pinger { inner: Arc::new(inner) })
    }

    /// Starts pinging `hostname` and returns at once; everything else is
    /// reported through the listener.
    ///
    /// Fails only for an invalid `config`.
    pub fn start(&self, hostname: &str, config: PingConfig) -> PingResult<PingId> {
        config.validate()?;
        let id = PingId(NEXT_PING_ID.fetch_add(1, Ordering::Relaxed));
        let (session, control_rx) = Session::new(
            id,
            hostname,
            config,
            self.inner.dispatcher.sender(),
            self.inner.transports.clone(),
            self.handle(),
        );

        lock(&self.inner.sessions).insert(id, session.clone());
        let spawned = thread::Builder::new()
            .name(format!("pinger-session-{id}"))
            .spawn(move || session.run(&control_rx));
        if let Err(e) = spawned {
            lock(&self.inner.sessions).remove(&id);
            return Err(PingError::Io(format!("cannot spawn session thread: {e}")));
        }
        tracing::debug!(ping_id = %id, hostname, "session started");
        Ok(id)
    }

    /// Stops one session. Unknown and already stopped ids are ignored.
    ///
    /// No callback other than `on_stop` runs for the session after this returns.
    pub fn stop(&self, id: PingId) {
        self.inner.stop(id);
    }

    pub fn stop_all(&self) {
        self.inner.stop_all();
    }

    pub fn handle(&self) -> PingerHandle {
        PingerHandle { inner: Arc::downgrade(&self.inner) }
    }

    /// Ids of the sessions that have not ended yet, in start order.
    pub fn sessions(&self) -> Vec<PingId> {
        let mut ids: Vec<PingId> = lock(&self.inner.sessions).keys().copied().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub(crate) fn transport_stats(&self, family: IcmpFamily) -> Option<transport::TransportStats> {
        self.inner.transports.stats(family)
    }
}

impl Inner {
    fn stop(&self, id: PingId) {
        let session = lock(&self.sessions).remove(&id);
        match session {
            Some(session) => session.stop(StopCause::Requested),
            None => tracing::trace!(ping_id = %id, "stop: no such session"),
        }
    }

    fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, session)| session).collect();
        tracing::debug!("stopping {} sessions", sessions.len());
        for session in sessions {
            session.stop(StopCause::Requested);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_all();
        self.dispatcher.shutdown();
        self.transports.halt_all();
        tracing::debug!("pinger dropped");
    }
}

impl PingerHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        PingerHandle { inner: Weak::new() }
    }

    pub fn stop(&self, id: PingId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop(id);
        }
    }

    pub fn stop_all(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop_all();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    // Drops the registry entry of a session that ended on its own.
    pub(crate) fn forget(&self, id: PingId) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.sessions).remove(&id);
        }
    }
}

impl std::fmt::Debug for PingerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingerHandle").field("alive", &self.is_alive()).finish()
    }
}
