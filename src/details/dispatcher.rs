use crate::details::lock;
use crate::{PingError, PingEvent, PingId, PingListener, PingResult};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

enum Dispatch {
    Event(PingId, PingEvent),
    /// The session's `Stop` has been handed over; forget about it.
    Retire(PingId),
    Shutdown,
}

// The dispatcher thread holds `delivery` for as long as a listener callback runs.
struct Gate {
    silenced: Mutex<HashSet<PingId>>,
    delivery: Mutex<()>,
}

/// Hands events to the listener on a single thread, in the order they were emitted.
pub(crate) struct Dispatcher {
    sender: DispatchSender,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) struct DispatchSender {
    tx: mpsc::Sender<Dispatch>,
    gate: Arc<Gate>,
    dispatcher_thread: ThreadId,
}

impl Dispatcher {
    pub(crate) fn start(listener: Box<dyn PingListener>) -> PingResult<Self> {
        let (tx, rx) = mpsc::channel::<Dispatch>();
        let gate = Arc::new(Gate { silenced: Mutex::new(HashSet::new()), delivery: Mutex::new(()) });
        let thread_gate = gate.clone();
        let handle = thread::Builder::new()
            .name("pinger-dispatch".to_owned())
            .spawn(move || dispatch_loop(listener.as_ref(), &thread_gate, &rx))
            .map_err(|e| PingError::Io(format!("cannot spawn dispatcher thread: {e}")))?;

        Ok(Dispatcher {
            sender: DispatchSender { tx, gate, dispatcher_thread: handle.thread().id() },
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn sender(&self) -> DispatchSender {
        self.sender.clone()
    }

    /// Delivers everything queued so far, then ends the dispatcher thread.
    pub(crate) fn shutdown(&self) {
        let _ = self.sender.tx.send(Dispatch::Shutdown);
        let handle = lock(&self.thread_handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // dropped from inside a callback; the loop ends after it returns
            } else if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}

impl DispatchSender {
    pub(crate) fn emit(&self, id: PingId, event: PingEvent) {
        if self.tx.send(Dispatch::Event(id, event)).is_err() {
            tracing::trace!(ping_id = %id, "dispatcher is gone, event dropped");
        }
    }

    /// Drops every undelivered event of `id` except its `Stop`.
    ///
    /// When called outside the dispatcher thread this waits for a callback in
    /// progress, so no other callback for `id` starts after it returns.
    pub(crate) fn close(&self, id: PingId) {
        lock(&self.gate.silenced).insert(id);
        if thread::current().id() != self.dispatcher_thread {
            drop(lock(&self.gate.delivery));
        }
        let _ = self.tx.send(Dispatch::Retire(id));
    }
}

fn dispatch_loop(listener: &dyn PingListener, gate: &Gate, rx: &mpsc::Receiver<Dispatch>) {
    for dispatch in rx {
        match dispatch {
            Dispatch::Event(id, event) => {
                let _delivery = lock(&gate.delivery);
                if !matches!(event, PingEvent::Stop(_)) && lock(&gate.silenced).contains(&id) {
                    tracing::trace!(ping_id = %id, "session closed, dropping {event:?}");
                    continue;
                }
                if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                    tracing::warn!(ping_id = %id, "listener panicked on {event:?}");
                }
            }
            Dispatch::Retire(id) => {
                lock(&gate.silenced).remove(&id);
            }
            Dispatch::Shutdown => break,
        }
    }
    tracing::debug!("dispatcher finished");
}
