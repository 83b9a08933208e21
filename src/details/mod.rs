use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) mod dispatcher;
pub(crate) mod icmp;
pub(crate) mod outstanding;
pub(crate) mod resolver;
pub(crate) mod session;
pub(crate) mod socket;
pub(crate) mod transport;

// A listener that panicked must not wedge the engine.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
