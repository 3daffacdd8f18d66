use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Triggered on the requester side when the owner of a contended lock
/// confirms that the lock has been released.
pub trait LockReleasedSignal: Send + Sync {
    fn trigger(&self);
}

/// Condvar-backed signal for blocking acquisition loops: the waiter sleeps
/// between retries, the contention listener wakes it the moment a release
/// confirmation arrives. A trigger delivered while nobody is waiting is
/// latched and consumed by the next wait.
#[derive(Debug, Default)]
pub struct AwaitableSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl AwaitableSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until triggered or until `timeout` elapses. Returns whether the
    /// signal fired; the latch is cleared either way.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let guard = self
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, false)
    }
}

impl LockReleasedSignal for AwaitableSignal {
    fn trigger(&self) {
        let mut triggered = self
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *triggered = true;
        self.condvar.notify_all();
    }
}
