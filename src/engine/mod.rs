//! The event engine (§4, §4.5): a single-threaded, cooperative multiplexer over
//! sockets, timers, and signals.
//!
//! Grounded on `ircd_events.c`'s `event_loop`/`event_execute` pair, but where the
//! original hand-picks a backend at compile time (`engine_kqueue.c`, `engine_epoll.c`,
//! `engine_poll.c`, `engine_select.c`, `engine_devpoll.c`) and shares a common
//! generator-list/event-queue implementation across all of them, `mio::Poll` already
//! does the backend selection for us — there is exactly one `Backend` here because
//! mio *is* the abstraction the original built five of by hand. What's left to
//! implement is the part `ircd_events.c` adds on top of the raw backend: generator
//! flags, the socket state/mask table, the timer queue, and the self-pipe signal
//! bridge, each factored into its own submodule.
//!
//! The engine is emphatically not `Send`/`Sync` (`Rc<RefCell<_>>`, not `Arc<Mutex<_>>`):
//! the design doc's single-thread invariant says no locking is required and no
//! reentrant dispatch is allowed, so there is nothing for a lock to protect. Every
//! method that fires a callback takes care to drop its internal borrow before
//! invoking it, so a callback is free to call back into the `Engine` it was handed
//! (add a timer, delete its own socket, etc.) without a `RefCell` panic.

mod signal;
mod socket;
mod timer;
pub mod types;

pub use timer::TimerKind;
pub use types::{Event, EventKind, GenFlags, GeneratorHandle, GeneratorId, Interest, MaskAction, SocketState};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::keyspace::Counter;
use crate::time::{Clock, SystemClock};
use mio::{Events, Poll, Token};
use signal::SignalTable;
use signal_hook_mio::v0_8::Signals;
use socket::Socket;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Callback invoked synchronously whenever a generator produces an event.
/// `Rc`, not `Arc`/`Box<dyn Fn + Send + Sync>`, because nothing here ever crosses
/// a thread boundary (see the module-level note on the single-thread invariant).
pub type EventCallback = Rc<dyn Fn(&Engine, Event)>;

/// Sentinel token for the shared signal self-pipe; real sockets are handed dense
/// tokens starting at 0, so this can never collide as long as a process has fewer
/// than `usize::MAX` live sockets.
const SIGNAL_TOKEN: Token = Token(usize::MAX);

/// Backend failures decay after an hour with no further errors (§4.5.7), mirroring
/// the original's `if (now - first_error > 3600) error_count = 0`.
const BACKEND_ERROR_DECAY_SECS: u64 = 3600;

struct Inner {
    poll: Poll,
    sockets: HashMap<Token, Socket>,
    next_token: usize,
    timers: timer::TimerQueue,
    /// The timer entry currently on the call stack (popped out of `timers` for the
    /// duration of its callback), so a reentrant `timer_del` on its own handle can
    /// still find it and mark it `DESTROY` rather than failing with `UnknownTimer`.
    firing_timer: Option<timer::TimerEntry>,
    signals: Option<Signals>,
    signal_table: SignalTable,
    ids: Counter,
    clock: Rc<dyn Clock>,
    config: Config,
    backend_errors: u32,
    backend_error_window_start: u64,
    running: bool,
}

/// A cheap-to-clone handle onto the engine. Every clone refers to the same
/// underlying loop; cloning is how a callback captures "the engine" without
/// borrowing it for its whole lifetime.
#[derive(Clone)]
pub struct Engine(Rc<RefCell<Inner>>);

fn socket_token(handle: GeneratorHandle) -> CoreResult<Token> {
    match handle {
        GeneratorHandle::Socket(token) => Ok(token),
        _ => Err(CoreError::UnknownSocket),
    }
}

fn timer_id(handle: GeneratorHandle) -> CoreResult<GeneratorId> {
    match handle {
        GeneratorHandle::Timer(id) => Ok(id),
        _ => Err(CoreError::UnknownTimer),
    }
}

fn signal_id(handle: GeneratorHandle) -> CoreResult<GeneratorId> {
    match handle {
        GeneratorHandle::Signal(id) => Ok(id),
        _ => Err(CoreError::UnknownSignal),
    }
}

/// Recompute and apply the `mio::Interest` a socket wants, given its current
/// `(state, mask)`, deregistering it entirely if it currently wants nothing.
fn reregister(poll: &mut Poll, sock: &mut Socket) -> CoreResult<()> {
    match socket::wanted_interest(sock.state, sock.mask) {
        Some(interest) => poll
            .registry()
            .reregister(sock.source.as_mut(), sock.token, interest)
            .map_err(|e| CoreError::BackendIo(e.to_string())),
        None => poll.registry().deregister(sock.source.as_mut()).or(Ok(())),
    }
}

/// Translate one readiness notification into the (possibly several) events it
/// implies, per §3.1/§3.2: a listening socket's readability is an `Accept`, a
/// connecting socket's writability is a `Connect`, and either half of the peer
/// closing its end is an `Eof` delivered alongside whatever else fired.
fn classify(state: SocketState, ev: &mio::event::Event) -> Vec<(EventKind, i64)> {
    if ev.is_error() {
        return vec![(EventKind::Error, 0)];
    }
    let mut kinds = Vec::new();
    if ev.is_read_closed() || ev.is_write_closed() {
        kinds.push((EventKind::Eof, 0));
    }
    if ev.is_readable() {
        kinds.push((if state == SocketState::Listening { EventKind::Accept } else { EventKind::Read }, 0));
    }
    if ev.is_writable() {
        kinds.push((if state == SocketState::Connecting { EventKind::Connect } else { EventKind::Write }, 0));
    }
    kinds
}

/// Which generator a queued dispatch belongs to, so its `refs` can be released
/// once the callback returns.
enum DispatchTarget {
    Socket(Token),
    Signal(GeneratorId),
}

impl Engine {
    /// Build an engine backed by the system clock.
    pub fn init(config: Config) -> CoreResult<Self> {
        Self::init_with_clock(config, Rc::new(SystemClock))
    }

    /// Build an engine backed by an arbitrary clock (tests use [`crate::time::VirtualClock`]
    /// so timer-fairness and backend-error-decay scenarios never need a real sleep).
    pub fn init_with_clock(config: Config, clock: Rc<dyn Clock>) -> CoreResult<Self> {
        let poll = Poll::new().map_err(|e| CoreError::BackendIo(e.to_string()))?;
        let now = clock.now();
        Ok(Engine(Rc::new(RefCell::new(Inner {
            poll,
            sockets: HashMap::new(),
            next_token: 0,
            timers: timer::TimerQueue::default(),
            firing_timer: None,
            signals: None,
            signal_table: SignalTable::default(),
            ids: Counter::new(),
            clock,
            config,
            backend_errors: 0,
            backend_error_window_start: now,
            running: false,
        }))))
    }

    /// Name of the concrete backend in use, for logging (`engine_name()` in the
    /// original; there all five backends compile in and one is picked at runtime,
    /// here `mio` has already made that choice for the whole process).
    pub fn engine_name(&self) -> &'static str {
        "mio"
    }

    pub fn now(&self) -> u64 {
        self.0.borrow().clock.now()
    }

    // ---- sockets ---------------------------------------------------------

    /// Register a new socket generator (`socket_add`). `source` must already be a
    /// non-blocking, already-connected-or-listening mio source; the engine only
    /// manages readiness, never blocking I/O itself.
    pub fn add_socket(
        &self,
        mut source: Box<dyn mio::event::Source + Send>,
        state: SocketState,
        mask: Interest,
        callback: EventCallback,
    ) -> CoreResult<GeneratorHandle> {
        let mut inner = self.0.borrow_mut();
        if inner.sockets.len() >= inner.config.max_sockets {
            return Err(CoreError::KeyspaceExhausted);
        }
        let token = Token(inner.next_token);
        inner.next_token += 1;
        if let Some(interest) = socket::wanted_interest(state, mask) {
            inner
                .poll
                .registry()
                .register(source.as_mut(), token, interest)
                .map_err(|e| CoreError::BackendIo(e.to_string()))?;
        }
        inner.sockets.insert(token, Socket::new(token, source, state, mask, callback));
        Ok(GeneratorHandle::Socket(token))
    }

    /// Move a socket to a new state (`socket_state`), re-deriving and re-arming its
    /// interest set. Rejects transitions `SocketState::can_transition_to` forbids.
    pub fn socket_state(&self, handle: GeneratorHandle, new_state: SocketState) -> CoreResult<()> {
        let token = socket_token(handle)?;
        let mut guard = self.0.borrow_mut();
        let Inner { poll, sockets, .. } = &mut *guard;
        let sock = sockets.get_mut(&token).ok_or(CoreError::UnknownSocket)?;
        if sock.state == new_state {
            return Ok(());
        }
        if !sock.state.can_transition_to(new_state) {
            return Err(CoreError::InvalidStateTransition);
        }
        sock.state = new_state;
        reregister(poll, sock)
    }

    /// Mutate a socket's readable/writable interest mask (`socket_events`). A no-op
    /// on sockets whose state doesn't consult the mask at all (listening sockets
    /// always watch read, connecting sockets always watch write).
    pub fn socket_events(&self, handle: GeneratorHandle, action: MaskAction, delta: Interest) -> CoreResult<()> {
        let token = socket_token(handle)?;
        let mut guard = self.0.borrow_mut();
        let Inner { poll, sockets, .. } = &mut *guard;
        let sock = sockets.get_mut(&token).ok_or(CoreError::UnknownSocket)?;
        if !sock.state.uses_interest_mask() {
            return Ok(());
        }
        sock.mask = action.apply(sock.mask, delta);
        reregister(poll, sock)
    }

    /// Mark a socket for deletion and deregister it from the backend (`socket_del`).
    /// Per §3.1/§4.5.6/§5's event-ref invariant: a generator with in-flight
    /// dispatches (`refs > 0` — one or more of its callbacks is still on the call
    /// stack, e.g. this very call came from one of them) must not be torn down or
    /// have its terminal `Destroy` fired yet. We set `DESTROY` and deregister the
    /// source immediately so no further readiness events are produced, but only
    /// remove the generator and fire `Destroy` here when `refs == 0`; otherwise the
    /// last in-flight dispatch to return (see `release_socket_ref`) finalizes it.
    pub fn socket_del(&self, handle: GeneratorHandle) -> CoreResult<()> {
        let token = socket_token(handle)?;
        let refs = {
            let mut inner = self.0.borrow_mut();
            let Inner { poll, sockets, .. } = &mut *inner;
            let sock = sockets.get_mut(&token).ok_or(CoreError::UnknownSocket)?;
            if sock.is_destroying() {
                return Err(CoreError::UnknownSocket);
            }
            sock.flags |= GenFlags::DESTROY;
            let _ = poll.registry().deregister(sock.source.as_mut());
            sock.refs
        };
        if refs == 0 {
            self.finalize_socket_destroy(token);
        }
        Ok(())
    }

    /// Remove a socket generator whose `refs` has just dropped to zero while
    /// `DESTROY` was set, and deliver its terminal event.
    fn finalize_socket_destroy(&self, token: Token) {
        let callback = {
            let mut inner = self.0.borrow_mut();
            inner.sockets.remove(&token).map(|s| s.callback)
        };
        if let Some(callback) = callback {
            callback(self, Event { kind: EventKind::Destroy, generator: GeneratorHandle::Socket(token), data: 0 });
        }
    }

    /// Release one dispatch's hold on a socket generator, finalizing its deferred
    /// destruction if this was the last one (§5 "Event ref invariant").
    fn release_socket_ref(&self, token: Token) {
        let finalize = {
            let mut inner = self.0.borrow_mut();
            match inner.sockets.get_mut(&token) {
                Some(sock) => {
                    sock.refs = sock.refs.saturating_sub(1);
                    sock.refs == 0 && sock.is_destroying()
                }
                None => false,
            }
        };
        if finalize {
            self.finalize_socket_destroy(token);
        }
    }

    // ---- timers ------------------------------------------------------------

    /// Arm a new timer (`timer_add`). `value` is seconds: an absolute deadline for
    /// `TimerKind::Absolute`, an offset from now otherwise.
    pub fn timer_add(&self, kind: TimerKind, value: u64, callback: EventCallback) -> GeneratorHandle {
        let mut inner = self.0.borrow_mut();
        let id = GeneratorId(inner.ids.next());
        let now = inner.clock.now();
        inner.timers.enqueue(id, kind, value, now, callback);
        GeneratorHandle::Timer(id)
    }

    /// Cancel a timer before it fires, delivering a `Destroy` event the same as a
    /// timer that fired and chose not to re-arm (`timer_del`). If the timer is
    /// queued and idle (`refs == 0`, the common case), it's removed and `Destroy`
    /// fires immediately. If this call arrived reentrantly from the timer's own
    /// `Expire` callback (it is `firing_timer`, `refs == 1`), we only mark it
    /// `DESTROY` and cancel any pending re-arm; `run_expired_timers` fires the
    /// terminal event once the callback returns (§3.1/§5's event-ref invariant).
    pub fn timer_del(&self, handle: GeneratorHandle) -> CoreResult<()> {
        let id = timer_id(handle)?;
        let mut inner = self.0.borrow_mut();
        if let Some(entry) = inner.timers.remove(id) {
            drop(inner);
            (entry.callback)(self, Event { kind: EventKind::Destroy, generator: handle, data: 0 });
            return Ok(());
        }
        match inner.firing_timer.as_mut() {
            Some(firing) if firing.id == id && !firing.flags.contains(GenFlags::DESTROY) => {
                firing.flags |= GenFlags::DESTROY;
                firing.flags.remove(GenFlags::READD);
                Ok(())
            }
            _ => Err(CoreError::UnknownTimer),
        }
    }

    /// Re-arm an already-queued timer with a new kind/value (`timer_chg`).
    pub fn timer_chg(&self, handle: GeneratorHandle, kind: TimerKind, value: u64) -> CoreResult<()> {
        let id = timer_id(handle)?;
        let mut inner = self.0.borrow_mut();
        let now = inner.clock.now();
        if inner.timers.change(id, kind, value, now) {
            Ok(())
        } else {
            Err(CoreError::UnknownTimer)
        }
    }

    // ---- signals -------------------------------------------------------------

    /// Register interest in a signal number (`signal_add`), lazily creating and
    /// registering the shared self-pipe source on first use.
    pub fn signal_add(&self, signo: i32, callback: EventCallback) -> CoreResult<GeneratorHandle> {
        let mut inner = self.0.borrow_mut();
        if inner.signals.is_none() {
            let mut signals = Signals::new(std::iter::empty::<i32>()).map_err(|e| CoreError::BackendIo(e.to_string()))?;
            inner
                .poll
                .registry()
                .register(&mut signals, SIGNAL_TOKEN, mio::Interest::READABLE)
                .map_err(|e| CoreError::BackendIo(e.to_string()))?;
            inner.signals = Some(signals);
        }
        inner
            .signals
            .as_mut()
            .expect("just initialized above")
            .add_signal(signo)
            .map_err(|e| CoreError::BackendIo(e.to_string()))?;
        let id = GeneratorId(inner.ids.next());
        inner.signal_table.add(id, signo, callback);
        Ok(GeneratorHandle::Signal(id))
    }

    /// Unregister a signal handler and deliver its terminal `Destroy` event
    /// (`signal_del`), deferred the same ref-checked way as [`Engine::socket_del`]
    /// if the generator currently has an in-flight dispatch.
    pub fn signal_del(&self, handle: GeneratorHandle) -> CoreResult<()> {
        let id = signal_id(handle)?;
        let refs = {
            let mut inner = self.0.borrow_mut();
            let entry = inner.signal_table.get_mut(id).ok_or(CoreError::UnknownSignal)?;
            if entry.flags.contains(GenFlags::DESTROY) {
                return Err(CoreError::UnknownSignal);
            }
            entry.flags |= GenFlags::DESTROY;
            entry.refs
        };
        if refs == 0 {
            self.finalize_signal_destroy(id);
        }
        Ok(())
    }

    fn finalize_signal_destroy(&self, id: GeneratorId) {
        let callback = {
            let mut inner = self.0.borrow_mut();
            let callback = inner.signal_table.callback_for_id(id);
            inner.signal_table.remove(id);
            callback
        };
        if let Some(callback) = callback {
            callback(self, Event { kind: EventKind::Destroy, generator: GeneratorHandle::Signal(id), data: 0 });
        }
    }

    fn release_signal_ref(&self, id: GeneratorId) {
        let finalize = {
            let mut inner = self.0.borrow_mut();
            match inner.signal_table.get_mut(id) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0 && entry.flags.contains(GenFlags::DESTROY)
                }
                None => false,
            }
        };
        if finalize {
            self.finalize_signal_destroy(id);
        }
    }

    // ---- manual event injection ------------------------------------------

    /// Synthesize an event for a generator outside the normal readiness path
    /// (`event_generate` in the original — used e.g. to report a synchronously
    /// discovered error without waiting for the backend to notice it).
    pub fn event_generate(&self, handle: GeneratorHandle, kind: EventKind, data: i64) -> CoreResult<()> {
        let callback = match handle {
            GeneratorHandle::Socket(token) => {
                let inner = self.0.borrow();
                inner.sockets.get(&token).map(|s| s.callback.clone()).ok_or(CoreError::UnknownSocket)?
            }
            GeneratorHandle::Timer(_) => return Err(CoreError::UnknownTimer),
            GeneratorHandle::Signal(id) => {
                let inner = self.0.borrow();
                inner.signal_table.callback_for_id(id).ok_or(CoreError::UnknownSignal)?
            }
        };
        callback(self, Event { kind, generator: handle, data });
        Ok(())
    }

    // ---- the loop --------------------------------------------------------

    /// Run until [`Engine::stop`] is called (`event_loop`). Blocks on the backend
    /// between iterations; wakes early for the next timer deadline if one is sooner
    /// than the idle poll interval.
    pub fn run(&self) -> CoreResult<()> {
        self.0.borrow_mut().running = true;
        while self.0.borrow().running {
            self.run_once(self.next_timeout())?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.0.borrow_mut().running = false;
    }

    fn next_timeout(&self) -> Option<Duration> {
        let inner = self.0.borrow();
        match inner.timers.next_expiry() {
            Some(expiry) => Some(Duration::from_secs(expiry.saturating_sub(inner.clock.now()))),
            // No timers armed: still wake periodically so `stop()` and a late-arriving
            // signal are noticed promptly rather than blocking forever.
            None => Some(Duration::from_secs(1)),
        }
    }

    /// Run a single poll-and-dispatch iteration (§4.5.3). Exposed separately from
    /// [`Engine::run`] so tests can step the loop deterministically.
    pub fn run_once(&self, timeout: Option<Duration>) -> CoreResult<()> {
        let mut events = Events::with_capacity(1024);
        let poll_result = {
            let mut inner = self.0.borrow_mut();
            inner.poll.poll(&mut events, timeout)
        };
        if let Err(e) = poll_result {
            if e.kind() != std::io::ErrorKind::Interrupted {
                self.record_backend_error()?;
            }
        }

        // `refs` is bumped for every dispatch queued here, before any callback runs,
        // so a `socket_del`/`signal_del` made from inside one callback defers its
        // generator's teardown until every dispatch already queued for this same
        // poll iteration has also returned (§3.1/§5 "Event ref invariant").
        let mut dispatches: Vec<(DispatchTarget, EventCallback, Event)> = Vec::new();
        {
            let mut inner = self.0.borrow_mut();
            for ev in events.iter() {
                let token = ev.token();
                if token == SIGNAL_TOKEN {
                    let pending: Vec<i32> = match inner.signals.as_mut() {
                        Some(signals) => signals.pending().collect(),
                        None => Vec::new(),
                    };
                    for signo in pending {
                        for entry in inner.signal_table.entries_for_mut(signo) {
                            entry.refs += 1;
                            dispatches.push((
                                DispatchTarget::Signal(entry.id),
                                entry.callback.clone(),
                                Event { kind: EventKind::Signal, generator: GeneratorHandle::Signal(entry.id), data: signo as i64 },
                            ));
                        }
                    }
                    continue;
                }
                if let Some(sock) = inner.sockets.get_mut(&token) {
                    for (kind, data) in classify(sock.state, ev) {
                        sock.refs += 1;
                        dispatches.push((
                            DispatchTarget::Socket(token),
                            sock.callback.clone(),
                            Event { kind, generator: GeneratorHandle::Socket(token), data },
                        ));
                    }
                }
            }
        }
        for (target, callback, event) in dispatches {
            callback(self, event);
            match target {
                DispatchTarget::Socket(token) => self.release_socket_ref(token),
                DispatchTarget::Signal(id) => self.release_signal_ref(id),
            }
        }

        self.run_expired_timers();
        Ok(())
    }

    /// Pop and fire every timer due by now, one at a time, dropping the internal
    /// borrow before each callback so it may freely re-enter the engine (arm
    /// another timer, delete a socket, ...). Mirrors `timer::run_expired`'s
    /// algorithm but cannot reuse it directly for that reason — see the
    /// module-level note on reentrancy.
    ///
    /// While a timer's `Expire` callback is running, the popped entry is parked in
    /// `Inner::firing_timer` (not just held on this stack frame) so a reentrant
    /// `timer_del` on the timer's own handle can still find it and mark `DESTROY`
    /// instead of erroring (§3.1/§5 "Event ref invariant").
    fn run_expired_timers(&self) {
        let now = self.now();
        loop {
            let popped = {
                let mut inner = self.0.borrow_mut();
                inner.timers.pop_expired(now)
            };
            let Some(mut entry) = popped else { break };

            entry.flags |= GenFlags::MARKED;
            entry.refs += 1;
            if entry.kind == TimerKind::Periodic {
                entry.flags |= GenFlags::READD;
            }

            let handle = GeneratorHandle::Timer(entry.id);
            let callback = entry.callback.clone();
            {
                let mut inner = self.0.borrow_mut();
                inner.firing_timer = Some(entry);
            }
            callback(self, Event { kind: EventKind::Expire, generator: handle, data: 0 });

            let mut entry = {
                let mut inner = self.0.borrow_mut();
                inner.firing_timer.take().expect("run_expired_timers always parks the entry it just popped")
            };
            entry.flags.remove(GenFlags::MARKED);
            entry.refs = entry.refs.saturating_sub(1);

            if entry.flags.contains(GenFlags::DESTROY) {
                (entry.callback)(self, Event { kind: EventKind::Destroy, generator: handle, data: 0 });
            } else if entry.flags.contains(GenFlags::READD) {
                entry.flags.remove(GenFlags::READD);
                let mut inner = self.0.borrow_mut();
                inner.timers.requeue(entry, now);
            } else {
                (entry.callback)(self, Event { kind: EventKind::Destroy, generator: handle, data: 0 });
            }
        }
    }

    fn record_backend_error(&self) -> CoreResult<()> {
        let mut inner = self.0.borrow_mut();
        let now = inner.clock.now();
        if now.saturating_sub(inner.backend_error_window_start) > BACKEND_ERROR_DECAY_SECS {
            inner.backend_errors = 0;
            inner.backend_error_window_start = now;
        }
        inner.backend_errors += 1;
        let threshold = inner.config.backend_error_threshold;
        if inner.backend_errors >= threshold {
            Err(CoreError::BackendRestartRequired)
        } else {
            Ok(())
        }
    }
}
