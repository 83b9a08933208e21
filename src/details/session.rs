use crate::details::dispatcher::DispatchSender;
use crate::details::icmp::{IcmpFamily, SequenceNumber};
use crate::details::lock;
use crate::details::outstanding::{OutstandingRequests, Outcome};
use crate::details::resolver;
use crate::details::transport::{EchoTransport, ReplySink, TransportPool};
use crate::{PingConfig, PingError, PingEvent, PingId, PingInfo, PingerHandle};
use std::net::IpAddr;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Created,
    Resolving,
    Running,
    Stopping,
    Stopped,
    Failed,
}

pub(crate) enum Control {
    /// Something changed that may end the session early.
    Wake,
    Halt,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StopCause {
    Requested,
    /// The last sequence got its outcome.
    Completed,
    Failed(PingError),
}

struct Route {
    transport: Arc<EchoTransport>,
    identifier: u16,
    addr: IpAddr,
}

struct SessionState {
    phases: Vec<Phase>,
    info: PingInfo,
    outstanding: OutstandingRequests,
    // `None` once the last sequence was sent
    next_sequence: Option<SequenceNumber>,
    route: Option<Route>,
}

impl SessionState {
    fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Created)
    }

    fn is_done(&self) -> bool {
        self.next_sequence.is_none() && self.outstanding.is_empty()
    }
}

enum Step {
    Wait(Option<Instant>),
    Complete,
    Fail(PingError),
    Exit,
}

/// One ping run against one host.
///
/// All events of a session are emitted while its state lock is held, so they
/// reach the dispatcher in the order they were detected and nothing is emitted
/// after `Stop`.
pub(crate) struct Session {
    id: PingId,
    hostname: String,
    config: PingConfig,
    payload: Vec<u8>,
    state: Mutex<SessionState>,
    control_tx: mpsc::Sender<Control>,
    dispatcher: DispatchSender,
    transports: Arc<TransportPool>,
    pinger: PingerHandle,
}

impl Session {
    pub(crate) fn new(
        id: PingId,
        hostname: &str,
        config: PingConfig,
        dispatcher: DispatchSender,
        transports: Arc<TransportPool>,
        pinger: PingerHandle,
    ) -> (Arc<Session>, mpsc::Receiver<Control>) {
        let (control_tx, control_rx) = mpsc::channel();
        let payload = config.build_payload();
        let info = PingInfo {
            ping_id: id,
            remote_host: hostname.to_owned(),
            remote_addr: None,
            reverse_dns: None,
            payload_size: config.payload_size,
            ttl: config.ttl,
            timeout: config.timeout,
            pinger: pinger.clone(),
        };
        let state = SessionState {
            phases: vec![Phase::Created],
            info,
            outstanding: OutstandingRequests::new(config.timeout),
            next_sequence: None,
            route: None,
        };
        let session = Session {
            id,
            hostname: hostname.to_owned(),
            config,
            payload,
            state: Mutex::new(state),
            control_tx,
            dispatcher,
            transports,
            pinger,
        };
        (Arc::new(session), control_rx)
    }

    #[cfg(test)]
    pub(crate) fn get_phases(&self) -> Vec<Phase> {
        lock(&self.state).phases.clone()
    }

    /// Body of the session thread.
    pub(crate) fn run(self: Arc<Self>, control_rx: &mpsc::Receiver<Control>) {
        {
            let mut state = lock(&self.state);
            if state.phase() != Phase::Created {
                return;
            }
            state.phases.push(Phase::Resolving);
        }
        tracing::debug!(ping_id = %self.id, host = %self.hostname, "resolving");

        let addr = match resolver::resolve(&self.hostname) {
            Ok(addr) => addr,
            Err(error) => return self.fail_early(error, false),
        };
        let reverse_dns = if self.config.reverse_lookup { resolver::reverse_lookup(addr) } else { None };
        self.connect(addr, reverse_dns, control_rx);
        tracing::debug!(ping_id = %self.id, "session thread finished");
    }

    // Second half of `run`, once the name lookups are done.
    fn connect(self: &Arc<Self>, addr: IpAddr, reverse_dns: Option<String>, control_rx: &mpsc::Receiver<Control>) {
        {
            let mut state = lock(&self.state);
            if state.phase() != Phase::Resolving {
                tracing::debug!(ping_id = %self.id, "stopped while resolving");
                return;
            }
            state.info.remote_addr = Some(addr);
            state.info.reverse_dns = reverse_dns;
        }

        let transport = match self.transports.acquire(IcmpFamily::of(&addr)) {
            Ok(transport) => transport,
            Err(error) => return self.fail_early(error, true),
        };
        let sink: Arc<dyn ReplySink> = self.clone();
        let identifier = match transport.register(sink) {
            Ok(identifier) => identifier,
            Err(error) => return self.fail_early(error, true),
        };

        if self.enter_running(Route { transport: transport.clone(), identifier, addr }) {
            self.drive(control_rx);
        } else {
            transport.unregister(identifier);
        }
    }

    /// Ends the session. Only the first call has an effect.
    pub(crate) fn stop(&self, cause: StopCause) {
        let route = {
            let mut state = lock(&self.state);
            let phase = state.phase();
            if matches!(phase, Phase::Stopping | Phase::Stopped | Phase::Failed) {
                return;
            }
            let cancelled = state.outstanding.clear();
            tracing::debug!(ping_id = %self.id, ?cause, cancelled, "stopping");
            let started = phase == Phase::Running;
            match &cause {
                StopCause::Failed(error) => {
                    if started {
                        self.emit_exception(&state, error.clone(), true);
                        self.dispatcher.emit(self.id, PingEvent::Stop(state.info.clone()));
                    }
                    state.phases.push(Phase::Failed);
                }
                StopCause::Requested | StopCause::Completed => {
                    state.phases.push(Phase::Stopping);
                    if started {
                        self.dispatcher.emit(self.id, PingEvent::Stop(state.info.clone()));
                    }
                    state.phases.push(Phase::Stopped);
                }
            }
            state.route.take()
        };

        if let Some(route) = route {
            route.transport.unregister(route.identifier);
        }
        let _ = self.control_tx.send(Control::Halt);
        if cause == StopCause::Requested {
            self.dispatcher.close(self.id);
        }
        self.pinger.forget(self.id);
    }

    fn fail_early(&self, error: PingError, is_fatal: bool) {
        {
            let mut state = lock(&self.state);
            if state.phase() != Phase::Resolving {
                return;
            }
            tracing::debug!(ping_id = %self.id, "session failed before start: {error}");
            self.emit_exception(&state, error, is_fatal);
            state.phases.push(Phase::Failed);
        }
        self.pinger.forget(self.id);
    }

    fn enter_running(&self, route: Route) -> bool {
        let mut state = lock(&self.state);
        if state.phase() != Phase::Resolving {
            return false;
        }
        state.phases.push(Phase::Running);
        state.route = Some(route);
        state.next_sequence = Some(SequenceNumber::start_value());
        self.dispatcher.emit(self.id, PingEvent::Start(state.info.clone()));
        tracing::debug!(ping_id = %self.id, "running");
        true
    }

    fn drive(&self, control_rx: &mpsc::Receiver<Control>) {
        let mut next_send = Instant::now();
        loop {
            let wait_until = match self.step(&mut next_send) {
                Step::Wait(wait_until) => wait_until,
                Step::Complete => return self.stop(StopCause::Completed),
                Step::Fail(error) => return self.stop(StopCause::Failed(error)),
                Step::Exit => return,
            };
            let control = match wait_until {
                Some(instant) => control_rx.recv_timeout(instant.saturating_duration_since(Instant::now())),
                None => control_rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match control {
                Ok(Control::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(Control::Halt) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn step(&self, next_send: &mut Instant) -> Step {
        let now = Instant::now();
        let mut state = lock(&self.state);
        if state.phase() != Phase::Running {
            return Step::Exit;
        }

        for sequence in state.outstanding.expire(now) {
            tracing::trace!(ping_id = %self.id, %sequence, "timeout");
            let info = state.info.clone();
            self.dispatcher.emit(self.id, PingEvent::Timeout { info, sequence: sequence.into() });
        }

        if *next_send <= now {
            if let Some(sequence) = state.next_sequence {
                state.next_sequence = sequence.next_within(self.config.max_sequence);
                *next_send += self.config.interval;
                if let Some(error) = self.send_request(&mut state, sequence) {
                    return Step::Fail(error);
                }
            }
        }

        if state.is_done() {
            return Step::Complete;
        }
        let deadline = state.outstanding.earliest_deadline();
        match (state.next_sequence, deadline) {
            (Some(_), Some(deadline)) => Step::Wait(Some(deadline.min(*next_send))),
            (Some(_), None) => Step::Wait(Some(*next_send)),
            (None, deadline) => Step::Wait(deadline),
        }
    }

    // Returns an error only when the transport can no longer be used.
    fn send_request(&self, state: &mut SessionState, sequence: SequenceNumber) -> Option<PingError> {
        let route = state.route.as_ref()?;
        let transport = route.transport.clone();
        let send_time = Instant::now();
        match transport.send(route.addr, route.identifier, sequence, &self.payload, self.config.ttl) {
            Ok(()) => {
                state.outstanding.insert(sequence, send_time);
                None
            }
            Err(error) => {
                tracing::warn!(ping_id = %self.id, %sequence, "{error}");
                let info = state.info.clone();
                self.dispatcher.emit(self.id, PingEvent::SendError { info, sequence: sequence.into() });
                if transport.is_failed() {
                    Some(PingError::Transport(format!("{:?} transport failed", transport.family())))
                } else {
                    None
                }
            }
        }
    }

    fn emit_exception(&self, state: &SessionState, error: PingError, is_fatal: bool) {
        let info = state.info.clone();
        self.dispatcher.emit(self.id, PingEvent::Exception { info, error, is_fatal });
    }
}

impl ReplySink for Session {
    fn on_echo_reply(&self, sequence: SequenceNumber, receive_time: Instant) {
        let mut state = lock(&self.state);
        if state.phase() != Phase::Running {
            return;
        }
        match state.outstanding.complete(sequence, receive_time) {
            Some(Outcome::Replied(elapsed)) => {
                tracing::trace!(ping_id = %self.id, %sequence, ?elapsed, "reply");
                let info = state.info.clone();
                self.dispatcher.emit(self.id, PingEvent::ReplyReceived { info, sequence: sequence.into(), elapsed });
            }
            Some(Outcome::TimedOut) => {
                tracing::trace!(ping_id = %self.id, %sequence, "late reply");
                let info = state.info.clone();
                self.dispatcher.emit(self.id, PingEvent::Timeout { info, sequence: sequence.into() });
            }
            None => {
                tracing::trace!(ping_id = %self.id, %sequence, "duplicate or expired reply");
            }
        }
        if state.is_done() {
            let _ = self.control_tx.send(Control::Wake);
        }
    }

    fn on_transport_error(&self, error: &PingError, is_fatal: bool) {
        if is_fatal {
            self.stop(StopCause::Failed(error.clone()));
            return;
        }
        let state = lock(&self.state);
        if state.phase() == Phase::Running {
            self.emit_exception(&state, error.clone(), false);
        }
    }
}
