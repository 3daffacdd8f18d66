use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{LockError, Result};
use crate::protocol::{self, PacketType};
use crate::signal::LockReleasedSignal;
use crate::transport::{Datagram, LockCommunicator};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DEFAULT_PING_GRACE_PERIOD: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 100;

/// Tunables for the negotiation protocol. The defaults match typical
/// same-host negotiation latency; hosts with unusual scheduling behaviour
/// can widen them.
#[derive(Debug, Clone)]
pub struct ContentionConfig {
    /// Minimum wait before re-pinging the same owner for the same lock
    /// while a confirmation is still outstanding.
    pub ping_grace_period: Duration,
    /// Consecutive listener failures tolerated before the handler gives up
    /// on negotiation and reports `is_running() == false`.
    pub max_consecutive_failures: u32,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            ping_grace_period: DEFAULT_PING_GRACE_PERIOD,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

// ---------------------------------------------------------------------------
// Public contract
// ---------------------------------------------------------------------------

/// Holder-side release callback, invoked at most once per contention cycle
/// when a peer asks for the lock. It must release the underlying lock and
/// then call [`ReleaseHandle::signal_released`] exactly once.
pub type WhenContended = Box<dyn FnOnce(ReleaseHandle) + Send + 'static>;

/// Negotiates release of exclusively-held file locks with peer processes
/// sharing the same cache directory.
pub trait ContentionHandler: Send + Sync {
    /// Register a release callback for a lock held (or about to be held) by
    /// this process. Clears any requester-side state remembered for this id
    /// from a previous acquisition cycle.
    fn start(&self, lock_id: u64, when_contended: WhenContended) -> Result<()>;

    /// Remove the contention registration for one lock. Idempotent.
    fn stop_lock(&self, lock_id: u64);

    /// Requester side: ask the owner listening on `owner_port` to release
    /// `lock_id`. Skips the send (returning `Ok(false)`) while a recent ping
    /// is unconfirmed or after the owner already confirmed the request.
    /// `elapsed` is the time since this caller last successfully pinged.
    fn maybe_ping_owner(
        &self,
        owner_port: u16,
        lock_id: u64,
        display_name: &str,
        elapsed: Duration,
        signal: Option<Arc<dyn LockReleasedSignal>>,
    ) -> Result<bool>;

    /// The port peers should ping to contend locks held by this process;
    /// `None` when this handler cannot be pinged.
    fn reserve_port(&self) -> Result<Option<u16>>;

    /// False once the listener has given up after repeated failures; callers
    /// should then fall back to blocking acquisition only.
    fn is_running(&self) -> bool;

    /// Shut the handler down: clears all registrations, stops the transport,
    /// the listener, and the release executor. Safe to call at any time.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// Pending requesters
// ---------------------------------------------------------------------------

/// Reply addresses collected while a release is in flight. Consumable
/// exactly once; a second consumption attempt is a protocol-misuse error
/// rather than a lost set of confirmations.
#[derive(Debug)]
enum RequesterSet {
    Open(HashSet<SocketAddr>),
    Consumed,
}

impl RequesterSet {
    fn new() -> Self {
        Self::Open(HashSet::new())
    }

    /// Record a requester. Requests landing after the set was consumed are
    /// dropped: the lock is already released and the sender's own retry
    /// will succeed.
    fn add(&mut self, addr: SocketAddr) {
        match self {
            Self::Open(addrs) => {
                addrs.insert(addr);
            }
            Self::Consumed => {
                debug!(%addr, "dropping unlock request that arrived after release");
            }
        }
    }

    fn take(&mut self) -> Option<HashSet<SocketAddr>> {
        match std::mem::replace(self, Self::Consumed) {
            Self::Open(addrs) => Some(addrs),
            Self::Consumed => None,
        }
    }
}

/// Holder-side bookkeeping for one contended lock.
struct ContendedAction {
    callback: Option<WhenContended>,
    requesters: Arc<Mutex<RequesterSet>>,
    running: bool,
}

impl ContendedAction {
    fn new(callback: WhenContended) -> Self {
        Self {
            callback: Some(callback),
            requesters: Arc::new(Mutex::new(RequesterSet::new())),
            running: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Release handle
// ---------------------------------------------------------------------------

/// Handed to a holder's release callback. Once the underlying lock is
/// released, `signal_released` consumes the requester set collected so far
/// and confirms the release to every peer in it.
pub struct ReleaseHandle {
    inner: ReleaseHandleInner,
}

enum ReleaseHandleInner {
    Active {
        lock_id: u64,
        requesters: Arc<Mutex<RequesterSet>>,
        communicator: Arc<LockCommunicator>,
    },
    /// For handlers without cross-process negotiation: nothing to confirm.
    Inert,
}

impl ReleaseHandle {
    fn active(
        lock_id: u64,
        requesters: Arc<Mutex<RequesterSet>>,
        communicator: Arc<LockCommunicator>,
    ) -> Self {
        Self {
            inner: ReleaseHandleInner::Active {
                lock_id,
                requesters,
                communicator,
            },
        }
    }

    fn inert() -> Self {
        Self {
            inner: ReleaseHandleInner::Inert,
        }
    }

    /// Notify every requester recorded up to this point that the lock has
    /// been released. Errs if called a second time: the requester set is
    /// consumable exactly once, which guards against a broken release
    /// callback double-reporting completion.
    pub fn signal_released(&self) -> Result<()> {
        let (lock_id, requesters, communicator) = match &self.inner {
            ReleaseHandleInner::Inert => return Ok(()),
            ReleaseHandleInner::Active {
                lock_id,
                requesters,
                communicator,
            } => (*lock_id, requesters, communicator),
        };
        let taken = requesters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(LockError::RequestersConsumed(lock_id))?;
        debug!(lock_id, requesters = taken.len(), "lock released, confirming to requesters");
        // sends happen outside any lock; each is independently best-effort
        communicator.confirm_lock_release(taken, lock_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Release executor
// ---------------------------------------------------------------------------

type ReleaseJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs release callbacks off the listener thread so a slow release (file
/// I/O, cache flushes) never stalls packet handling.
struct ReleaseExecutor {
    sender: Option<Sender<ReleaseJob>>,
    worker: Option<JoinHandle<()>>,
}

impl ReleaseExecutor {
    fn spawn() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<ReleaseJob>();
        let worker = std::thread::Builder::new()
            .name("lock-release-executor".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn submit(&self, job: ReleaseJob) {
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                warn!("release executor is gone, dropping release action");
            }
        }
    }

    /// Drains queued jobs, then joins the worker.
    fn stop(mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("release executor worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UDP contention handler
// ---------------------------------------------------------------------------

/// All shared mutable state lives behind one mutex: the listener thread and
/// every public method observe it consistently, never in partial states.
struct HandlerState {
    communicator: Option<Arc<LockCommunicator>>,
    listener: Option<JoinHandle<()>>,
    executor: Option<ReleaseExecutor>,
    stopped: bool,
    /// Holder side: one action per lock id, at most.
    contended: HashMap<u64, ContendedAction>,
    /// Requester side: the owner port we last pinged per lock id.
    last_pinged_owner: HashMap<u64, u16>,
    /// Requester side: owners that confirmed an unlock request, keyed the
    /// same way. Suppresses redundant pings while the release is underway.
    confirmed_owner: HashMap<u64, u16>,
    /// Requester side: signals to trigger when the release is confirmed.
    release_signals: HashMap<u64, Arc<dyn LockReleasedSignal>>,
}

impl HandlerState {
    fn new() -> Self {
        Self {
            communicator: None,
            listener: None,
            executor: None,
            stopped: false,
            contended: HashMap::new(),
            last_pinged_owner: HashMap::new(),
            confirmed_owner: HashMap::new(),
            release_signals: HashMap::new(),
        }
    }
}

/// The negotiating contention handler: listens on a loopback UDP port for
/// unlock requests against locks this process holds, and pings the owners
/// of locks this process wants.
pub struct UdpContentionHandler {
    state: Arc<Mutex<HandlerState>>,
    listener_failed: Arc<AtomicBool>,
    config: ContentionConfig,
}

impl UdpContentionHandler {
    pub fn new() -> Self {
        Self::with_config(ContentionConfig::default())
    }

    pub fn with_config(config: ContentionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandlerState::new())),
            listener_failed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_communicator(state: &mut HandlerState) -> Result<Arc<LockCommunicator>> {
        if state.stopped {
            return Err(LockError::HandlerStopped);
        }
        if let Some(communicator) = &state.communicator {
            return Ok(Arc::clone(communicator));
        }
        let communicator = Arc::new(LockCommunicator::bind()?);
        state.communicator = Some(Arc::clone(&communicator));
        Ok(communicator)
    }

    fn ensure_listener(
        &self,
        state: &mut HandlerState,
        communicator: Arc<LockCommunicator>,
    ) -> Result<()> {
        if state.listener.is_some() {
            return Ok(());
        }
        state.executor = Some(ReleaseExecutor::spawn()?);
        let shared = Arc::clone(&self.state);
        let failed = Arc::clone(&self.listener_failed);
        let max_failures = self.config.max_consecutive_failures;
        let listener = std::thread::Builder::new()
            .name("lock-contention-listener".into())
            .spawn(move || listener_loop(&shared, &communicator, &failed, max_failures))?;
        state.listener = Some(listener);
        Ok(())
    }
}

impl Default for UdpContentionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentionHandler for UdpContentionHandler {
    fn start(&self, lock_id: u64, when_contended: WhenContended) -> Result<()> {
        let mut state = self.lock_state();
        if state.stopped {
            return Err(LockError::HandlerStopped);
        }
        // a new acquisition cycle invalidates requester-side memory of this id
        state.last_pinged_owner.remove(&lock_id);
        state.confirmed_owner.remove(&lock_id);
        state.release_signals.remove(&lock_id);

        let communicator = Self::ensure_communicator(&mut state)?;
        self.ensure_listener(&mut state, communicator)?;

        if state.contended.contains_key(&lock_id) {
            return Err(LockError::AlreadyContended(lock_id));
        }
        state
            .contended
            .insert(lock_id, ContendedAction::new(when_contended));
        Ok(())
    }

    fn stop_lock(&self, lock_id: u64) {
        // an in-flight release action keeps its own handle on the requester
        // set and still notifies whoever it captured
        self.lock_state().contended.remove(&lock_id);
    }

    fn maybe_ping_owner(
        &self,
        owner_port: u16,
        lock_id: u64,
        display_name: &str,
        elapsed: Duration,
        signal: Option<Arc<dyn LockReleasedSignal>>,
    ) -> Result<bool> {
        let (communicator, stored_signal) = {
            let mut state = self.lock_state();
            if state.stopped {
                return Err(LockError::HandlerStopped);
            }
            if state.confirmed_owner.get(&lock_id) == Some(&owner_port) {
                // the owner is already working on it; wait for the release
                return Ok(false);
            }
            if state.last_pinged_owner.get(&lock_id) == Some(&owner_port)
                && elapsed < self.config.ping_grace_period
            {
                return Ok(false);
            }
            let communicator = Self::ensure_communicator(&mut state)?;
            // stored before the send: a confirmation can race back through
            // the listener faster than this thread re-takes the state lock
            let stored_signal = signal.map(|signal| {
                let stored = Arc::clone(&signal);
                state.release_signals.insert(lock_id, signal);
                stored
            });
            (communicator, stored_signal)
        };

        // the send happens outside the state lock
        if !communicator.ping_owner(owner_port, lock_id, display_name) {
            if let Some(stored) = stored_signal {
                let mut state = self.lock_state();
                if state
                    .release_signals
                    .get(&lock_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &stored))
                {
                    state.release_signals.remove(&lock_id);
                }
            }
            return Ok(false);
        }
        self.lock_state().last_pinged_owner.insert(lock_id, owner_port);
        Ok(true)
    }

    fn reserve_port(&self) -> Result<Option<u16>> {
        let mut state = self.lock_state();
        let communicator = Self::ensure_communicator(&mut state)?;
        Ok(communicator.port())
    }

    fn is_running(&self) -> bool {
        !self.listener_failed.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        let (communicator, listener, executor) = {
            let mut state = self.lock_state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.contended.clear();
            state.last_pinged_owner.clear();
            state.confirmed_owner.clear();
            state.release_signals.clear();
            (
                state.communicator.take(),
                state.listener.take(),
                state.executor.take(),
            )
        };
        if let Some(communicator) = &communicator {
            communicator.stop();
        }
        if let Some(listener) = listener {
            if listener.join().is_err() {
                warn!("contention listener panicked during shutdown");
            }
        }
        if let Some(executor) = executor {
            executor.stop();
        }
    }
}

impl Drop for UdpContentionHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Listener loop
// ---------------------------------------------------------------------------

fn listener_loop(
    state: &Arc<Mutex<HandlerState>>,
    communicator: &Arc<LockCommunicator>,
    listener_failed: &AtomicBool,
    max_failures: u32,
) {
    let mut consecutive_failures = 0u32;
    loop {
        {
            let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.stopped {
                return;
            }
        }
        match listen_once(state, communicator) {
            Ok(()) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures >= max_failures {
                    error!(
                        %err,
                        failures = consecutive_failures,
                        "contention listener giving up; falling back to blocking locks only"
                    );
                    listener_failed.store(true, Ordering::SeqCst);
                    return;
                }
                warn!(%err, failures = consecutive_failures, "contention listener iteration failed");
            }
        }
    }
}

/// One iteration: block for a datagram, decode it, update the bookkeeping
/// under the state lock, then perform any resulting sends outside it.
fn listen_once(state: &Arc<Mutex<HandlerState>>, communicator: &Arc<LockCommunicator>) -> Result<()> {
    let Some(datagram) = communicator.receive()? else {
        // benign wake: the loop re-checks the stop flag
        return Ok(());
    };
    let packet = protocol::decode(datagram.payload())?;

    let mut confirm_request_to = None;
    let mut trigger = None;
    {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.stopped {
            return Ok(());
        }
        if guard.contended.contains_key(&packet.lock_id) {
            handle_as_holder(&mut guard, &packet, &datagram, communicator, &mut confirm_request_to);
        } else {
            handle_as_requester(&mut guard, &packet, &datagram, &mut trigger);
        }
    }
    if let Some(reply_addr) = confirm_request_to {
        communicator.confirm_unlock_request(reply_addr, packet.lock_id);
    }
    if let Some(signal) = trigger {
        signal.trigger();
    }
    Ok(())
}

/// This process holds `packet.lock_id`: queue the requester, kick off the
/// release action if it is not already running, and confirm receipt. Every
/// requester gets a confirmation even though the release runs only once.
fn handle_as_holder(
    guard: &mut HandlerState,
    packet: &protocol::Packet,
    datagram: &Datagram,
    communicator: &Arc<LockCommunicator>,
    confirm_request_to: &mut Option<SocketAddr>,
) {
    if packet.packet_type != PacketType::UnlockRequest {
        debug!(
            lock_id = packet.lock_id,
            packet_type = %packet.packet_type,
            "ignoring confirmation packet for a lock this process holds"
        );
        return;
    }
    let job = {
        let Some(action) = guard.contended.get_mut(&packet.lock_id) else {
            return;
        };
        action
            .requesters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(datagram.from());
        if action.running {
            None
        } else {
            action.running = true;
            let handle = ReleaseHandle::active(
                packet.lock_id,
                Arc::clone(&action.requesters),
                Arc::clone(communicator),
            );
            action
                .callback
                .take()
                .map(|callback| Box::new(move || callback(handle)) as ReleaseJob)
        }
    };
    if let Some(job) = job {
        match guard.executor.as_ref() {
            Some(executor) => {
                debug!(lock_id = packet.lock_id, "scheduling release of contended lock");
                executor.submit(job);
            }
            None => warn!(lock_id = packet.lock_id, "no release executor available"),
        }
    }
    *confirm_request_to = Some(datagram.from());
}

/// This process does not hold `packet.lock_id`, so the packet must be an
/// answer to one of our own pings.
fn handle_as_requester(
    guard: &mut HandlerState,
    packet: &protocol::Packet,
    datagram: &Datagram,
    trigger: &mut Option<Arc<dyn LockReleasedSignal>>,
) {
    match packet.packet_type {
        PacketType::LockReleaseConfirmation => {
            guard.last_pinged_owner.remove(&packet.lock_id);
            guard.confirmed_owner.remove(&packet.lock_id);
            match guard.release_signals.remove(&packet.lock_id) {
                Some(signal) => {
                    debug!(lock_id = packet.lock_id, "owner released the lock");
                    *trigger = Some(signal);
                }
                None => {
                    debug!(lock_id = packet.lock_id, "release confirmed but nobody is waiting");
                }
            }
        }
        PacketType::UnlockRequestConfirmation => {
            debug!(
                lock_id = packet.lock_id,
                owner_port = datagram.from().port(),
                "owner confirmed our unlock request"
            );
            guard
                .confirmed_owner
                .insert(packet.lock_id, datagram.from().port());
        }
        PacketType::UnlockRequest => {
            debug!(
                lock_id = packet.lock_id,
                "ignoring unlock request for a lock this process does not hold"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Rejecting variant
// ---------------------------------------------------------------------------

/// Contention handler for processes that opt out of cross-process
/// negotiation entirely: no socket is opened and no port is ever advertised,
/// so no compliant peer will ping this process. Release callbacks are
/// invoked immediately on registration, treating release as instantaneous.
pub struct RejectingContentionHandler;

impl ContentionHandler for RejectingContentionHandler {
    fn start(&self, _lock_id: u64, when_contended: WhenContended) -> Result<()> {
        when_contended(ReleaseHandle::inert());
        Ok(())
    }

    fn stop_lock(&self, _lock_id: u64) {}

    fn maybe_ping_owner(
        &self,
        _owner_port: u16,
        _lock_id: u64,
        _display_name: &str,
        _elapsed: Duration,
        _signal: Option<Arc<dyn LockReleasedSignal>>,
    ) -> Result<bool> {
        Err(LockError::NegotiationUnsupported)
    }

    fn reserve_port(&self) -> Result<Option<u16>> {
        Ok(None)
    }

    fn is_running(&self) -> bool {
        true
    }

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn requester_set_is_consumed_exactly_once() {
        let mut requesters = RequesterSet::new();
        requesters.add(addr(1000));
        requesters.add(addr(2000));
        requesters.add(addr(1000));

        let taken = requesters.take().unwrap();
        assert_eq!(taken.len(), 2);
        assert!(requesters.take().is_none());
    }

    #[test]
    fn requests_after_consumption_are_dropped() {
        let mut requesters = RequesterSet::new();
        requesters.take().unwrap();
        requesters.add(addr(1000));
        assert!(requesters.take().is_none());
    }

    #[test]
    fn config_defaults_match_protocol_constants() {
        let config = ContentionConfig::default();
        assert_eq!(config.ping_grace_period, Duration::from_millis(1000));
        assert_eq!(config.max_consecutive_failures, 100);
    }

    #[test]
    fn double_start_for_same_lock_id_is_rejected() {
        let handler = UdpContentionHandler::new();
        handler.start(42, Box::new(|_| {})).unwrap();

        let err = handler.start(42, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, LockError::AlreadyContended(42)));
        handler.stop();
    }

    #[test]
    fn start_after_stop_lock_begins_a_fresh_cycle() {
        let handler = UdpContentionHandler::new();
        handler.start(42, Box::new(|_| {})).unwrap();
        handler.stop_lock(42);
        handler.start(42, Box::new(|_| {})).unwrap();
        handler.stop();
    }

    #[test]
    fn start_and_ping_after_stop_are_rejected() {
        let handler = UdpContentionHandler::new();
        handler.start(42, Box::new(|_| {})).unwrap();
        handler.stop();

        let err = handler.start(43, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, LockError::HandlerStopped));

        let err = handler
            .maybe_ping_owner(9125, 43, "cache", Duration::ZERO, None)
            .unwrap_err();
        assert!(matches!(err, LockError::HandlerStopped));
    }

    #[test]
    fn stop_without_start_is_safe_and_idempotent() {
        let handler = UdpContentionHandler::new();
        handler.stop();
        handler.stop();
        assert!(handler.is_running());
    }

    #[test]
    fn reserve_port_is_stable_across_calls() {
        let handler = UdpContentionHandler::new();
        let port = handler.reserve_port().unwrap();
        assert!(port.is_some());
        assert_eq!(handler.reserve_port().unwrap(), port);
        handler.stop();
    }

    #[test]
    fn rejecting_handler_runs_release_callback_immediately() {
        let handler = RejectingContentionHandler;
        let invocations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&invocations);
        handler
            .start(
                42,
                Box::new(move |handle| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    handle.signal_released().unwrap();
                }),
            )
            .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejecting_handler_cannot_ping() {
        let handler = RejectingContentionHandler;
        let err = handler
            .maybe_ping_owner(9125, 42, "cache", Duration::ZERO, None)
            .unwrap_err();
        assert!(matches!(err, LockError::NegotiationUnsupported));
        assert_eq!(handler.reserve_port().unwrap(), None);
        assert!(handler.is_running());
    }
}
