use crate::{PingError, PingId, PingInfo};
use std::sync::mpsc;
use std::time::Duration;

/// One notification about one session.
///
/// Per session they arrive in the order the engine detected them: `Start`,
/// then the per-sequence outcomes, then a single `Stop`.
#[derive(Clone, Debug)]
pub enum PingEvent {
    Start(PingInfo),
    Stop(PingInfo),
    ReplyReceived { info: PingInfo, sequence: u16, elapsed: Duration },
    Timeout { info: PingInfo, sequence: u16 },
    SendError { info: PingInfo, sequence: u16 },
    Exception { info: PingInfo, error: PingError, is_fatal: bool },
}

impl PingEvent {
    pub fn info(&self) -> &PingInfo {
        match self {
            PingEvent::Start(info)
            | PingEvent::Stop(info)
            | PingEvent::ReplyReceived { info, .. }
            | PingEvent::Timeout { info, .. }
            | PingEvent::SendError { info, .. }
            | PingEvent::Exception { info, .. } => info,
        }
    }

    pub fn ping_id(&self) -> PingId {
        self.info().ping_id
    }

    pub fn sequence(&self) -> Option<u16> {
        match self {
            PingEvent::ReplyReceived { sequence, .. }
            | PingEvent::Timeout { sequence, .. }
            | PingEvent::SendError { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

/// Receives the notifications of every session of a `Pinger`.
///
/// All handlers are optional. They run on the engine's dispatcher thread, one
/// at a time; a handler may call `stop` on the `PingInfo` it was given.
#[allow(clippy::module_name_repetitions)]
pub trait PingListener: Send + Sync {
    fn on_start(&self, _info: &PingInfo) {}

    fn on_stop(&self, _info: &PingInfo) {}

    fn on_send_error(&self, _info: &PingInfo, _sequence: u16) {}

    fn on_reply_received(&self, _info: &PingInfo, _sequence: u16, _elapsed: Duration) {}

    fn on_timeout(&self, _info: &PingInfo, _sequence: u16) {}

    fn on_exception(&self, _info: &PingInfo, _error: &PingError, _is_fatal: bool) {}

    fn on_event(&self, event: &PingEvent) {
        match event {
            PingEvent::Start(info) => self.on_start(info),
            PingEvent::Stop(info) => self.on_stop(info),
            PingEvent::ReplyReceived { info, sequence, elapsed } => self.on_reply_received(info, *sequence, *elapsed),
            PingEvent::Timeout { info, sequence } => self.on_timeout(info, *sequence),
            PingEvent::SendError { info, sequence } => self.on_send_error(info, *sequence),
            PingEvent::Exception { info, error, is_fatal } => self.on_exception(info, error, *is_fatal),
        }
    }
}

/// Forwards every event into a channel, for consumers that run their own loop.
pub struct ChannelListener {
    tx: mpsc::Sender<PingEvent>,
}

impl ChannelListener {
    pub fn new() -> (ChannelListener, mpsc::Receiver<PingEvent>) {
        let (tx, rx) = mpsc::channel();
        (ChannelListener { tx }, rx)
    }
}

impl PingListener for ChannelListener {
    fn on_event(&self, event: &PingEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!("event receiver is gone, dropping {event:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PingerHandle;
    use std::sync::Mutex;

    fn info() -> PingInfo {
        PingInfo {
            ping_id: PingId(1),
            remote_host: "localhost".to_owned(),
            remote_addr: None,
            reverse_dns: None,
            payload_size: 0,
            ttl: 1,
            timeout: Duration::from_secs(1),
            pinger: PingerHandle::detached(),
        }
    }

    #[derive(Default)]
    struct TimeoutsOnly {
        timeouts: Mutex<Vec<u16>>,
    }

    impl PingListener for TimeoutsOnly {
        fn on_timeout(&self, _info: &PingInfo, sequence: u16) {
            self.timeouts.lock().unwrap().push(sequence);
        }
    }

    #[test]
    fn unhandled_events_are_ignored() {
        let listener = TimeoutsOnly::default();

        listener.on_event(&PingEvent::Start(info()));
        listener.on_event(&PingEvent::Timeout { info: info(), sequence: 4 });
        listener.on_event(&PingEvent::ReplyReceived { info: info(), sequence: 5, elapsed: Duration::ZERO });
        listener.on_event(&PingEvent::Stop(info()));

        assert_eq!(vec![4], *listener.timeouts.lock().unwrap());
    }

    #[test]
    fn channel_listener_forwards_events() {
        let (listener, rx) = ChannelListener::new();

        listener.on_event(&PingEvent::SendError { info: info(), sequence: 2 });

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PingEvent::SendError { sequence: 2, .. }));
        assert_eq!(PingId(1), event.ping_id());
        assert_eq!(Some(2), event.sequence());
    }

    #[test]
    fn channel_listener_survives_dropped_receiver() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);

        listener.on_event(&PingEvent::Stop(info()));
    }
}
