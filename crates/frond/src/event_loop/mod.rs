//! event loop
//!
//! One cooperative scheduler per creating thread: a ready queue of deferred
//! callbacks, a monotonic timer set, per-fd readiness dispatch, signal
//! dispatch, a cross-thread waker, and the fiber hand-off that suspends and
//! resumes tasks. The loop owns a distinguished fiber which drives the
//! poller; all task fibers are parented under it and control always returns
//! to the loop fiber between ready-queue drains.

mod poller;

use crate::fiber::{Fiber, Interrupt};
use crate::work::ThreadPool;
use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token, Waker};
use parking_lot::Mutex;
use poller::{Poller, Wake, SIGNAL_TOKEN};
use signal_hook_mio::v0_8::Signals;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Highest supported signal number (exclusive).
const NSIG: i32 = 64;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoop>> = RefCell::new(None);
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("cannot instantiate more than one event loop per thread")]
    Exists,
    #[error("there is no event loop in the current thread")]
    NoLoop,
    #[error("event loop was already started")]
    AlreadyStarted,
    #[error("event loop has not been started yet")]
    NotStarted,
    #[error("event loop has already ended")]
    Ended,
    #[error("operation forbidden while the event loop is running")]
    Running,
    #[error("event loop already destroyed")]
    Destroyed,
    #[error("only the thread that created the event loop may do this")]
    WrongThread,
    #[error("another reader is already registered for fd {0}")]
    ReaderRegistered(RawFd),
    #[error("another writer is already registered for fd {0}")]
    WriterRegistered(RawFd),
    #[error("signal {0} out of range(1, {NSIG})")]
    BadSignal(i32),
    #[error("tasks can only be started once")]
    TaskStarted,
    #[error("cannot join a task before it is started")]
    TaskNotStarted,
    #[error("io error => {0}")]
    Io(#[from] io::Error),
}

enum Callback {
    Once(Option<Box<dyn FnOnce() + Send>>),
    Repeat(Box<dyn FnMut() + Send>),
}

struct HandlerInner {
    cancelled: AtomicBool,
    callback: Mutex<Callback>,
}

/// A deferred, cancellable callback. Once cancelled it is never invoked,
/// even if it already sits in the ready queue (the drain skips it).
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    fn once<F: FnOnce() + Send + 'static>(f: F) -> Handler {
        Handler {
            inner: Arc::new(HandlerInner {
                cancelled: AtomicBool::new(false),
                callback: Mutex::new(Callback::Once(Some(Box::new(f)))),
            }),
        }
    }

    fn repeat<F: FnMut() + Send + 'static>(f: F) -> Handler {
        Handler {
            inner: Arc::new(HandlerInner {
                cancelled: AtomicBool::new(false),
                callback: Mutex::new(Callback::Repeat(Box::new(f))),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn invoke(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut callback = self.inner.callback.lock();
        match &mut *callback {
            Callback::Once(f) => {
                if let Some(f) = f.take() {
                    drop(callback);
                    f();
                }
            }
            Callback::Repeat(f) => f(),
        }
    }
}

/// A [`Handler`] bound to an entry in the loop's timer set. Cancelling stops
/// the callback and removes the timer so it no longer keeps the loop alive.
pub struct Timer {
    handler: Handler,
    id: u64,
    lp: Weak<LoopInner>,
}

impl Timer {
    fn unscheduled(handler: Handler) -> Timer {
        Timer {
            handler,
            id: 0,
            lp: Weak::new(),
        }
    }

    pub fn cancel(&self) {
        self.handler.cancel();
        if let Some(lp) = self.lp.upgrade() {
            lp.state.lock().timers.remove(&self.id);
        }
    }

    /// True while the timer is scheduled to fire.
    pub fn is_pending(&self) -> bool {
        match self.lp.upgrade() {
            Some(lp) => lp.state.lock().timers.contains_key(&self.id),
            None => false,
        }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// A [`Handler`] bound to a signal registration. Cancelling removes it from
/// the loop's signal map; remaining handlers for the signal keep firing.
pub struct SignalHandler {
    handler: Handler,
    sig: i32,
    id: u64,
    lp: Weak<LoopInner>,
}

impl SignalHandler {
    pub fn cancel(&self) {
        self.handler.cancel();
        if let Some(lp) = self.lp.upgrade() {
            let mut state = lp.state.lock();
            if let Some(handlers) = state.signal_map.get_mut(&self.sig) {
                handlers.retain(|(id, _)| *id != self.id);
                if handlers.is_empty() {
                    state.signal_map.remove(&self.sig);
                }
            }
        }
    }

    pub fn signal(&self) -> i32 {
        self.sig
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PollEvents: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

impl PollEvents {
    fn interest(self) -> Option<Interest> {
        match (self.contains(PollEvents::READABLE), self.contains(PollEvents::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Per-fd registration: at most one reader and one writer, with the mask
/// always mirroring which handlers are set.
struct PollState {
    mask: PollEvents,
    read_handler: Option<Handler>,
    write_handler: Option<Handler>,
}

struct TimerEntry {
    handler: Handler,
    period: Option<Duration>,
}

struct LoopState {
    ready: VecDeque<Handler>,
    fd_map: HashMap<RawFd, PollState>,
    timers: HashMap<u64, TimerEntry>,
    // Deadlines, ordered. Stale keys (cancelled timers) are pruned lazily.
    schedule: BTreeMap<(Instant, u64), ()>,
    signal_map: HashMap<i32, Vec<(u64, Handler)>>,
}

pub(crate) struct LoopInner {
    fiber: Fiber,
    creator: Fiber,
    creator_thread: ThreadId,
    registry: Registry,
    waker: Waker,
    signals: Mutex<Option<Signals>>,
    poller: Mutex<Option<Poller>>,
    state: Mutex<LoopState>,
    threadpool: Mutex<Option<ThreadPool>>,
    started: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    destroyed: AtomicBool,
    pending_work: AtomicUsize,
    next_id: AtomicU64,
}

/// Handle to the per-thread event loop. Clones share the loop; the handle is
/// `Send + Sync` so foreign threads may hold one for
/// [`EventLoop::call_from_thread`].
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Create the event loop for the current thread. Fails if the thread
    /// already has one.
    pub fn new() -> Result<EventLoop, LoopError> {
        let occupied = CURRENT_LOOP.with(|c| c.borrow().is_some());
        if occupied {
            return Err(LoopError::Exists);
        }
        let (poller, registry, waker) = Poller::new()?;
        let mut signals = Signals::new(std::iter::empty::<i32>())?;
        registry.register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        let creator = Fiber::current();

        let inner = Arc::new_cyclic(|weak: &Weak<LoopInner>| {
            let weak = weak.clone();
            let fiber = Fiber::spawn("event-loop", Some(creator.clone()), move || {
                if let Some(inner) = weak.upgrade() {
                    CURRENT_LOOP.with(|c| {
                        *c.borrow_mut() = Some(EventLoop { inner: inner.clone() })
                    });
                    inner.run_reactor();
                }
            });
            LoopInner {
                fiber,
                creator,
                creator_thread: thread::current().id(),
                registry,
                waker,
                signals: Mutex::new(Some(signals)),
                poller: Mutex::new(Some(poller)),
                state: Mutex::new(LoopState {
                    ready: VecDeque::new(),
                    fd_map: HashMap::new(),
                    timers: HashMap::new(),
                    schedule: BTreeMap::new(),
                    signal_map: HashMap::new(),
                }),
                threadpool: Mutex::new(None),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                pending_work: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }
        });
        let lp = EventLoop { inner };
        CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(lp.clone()));
        Ok(lp)
    }

    /// The event loop bound to the current fiber's thread-local context.
    ///
    /// Panics when there is none; use [`EventLoop::try_current`] to probe.
    pub fn current() -> EventLoop {
        EventLoop::try_current().expect("there is no event loop in the current thread")
    }

    pub fn try_current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|c| c.borrow().clone())
    }

    /// Seed the thread-local loop reference for a freshly spawned fiber.
    pub(crate) fn enter(lp: &EventLoop) {
        CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(lp.clone()));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Monotonic now, the time base for [`EventLoop::call_at`].
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    pub(crate) fn loop_fiber(&self) -> &Fiber {
        &self.inner.fiber
    }

    // scheduling

    /// Queue `f` to run on the next ready-queue drain.
    pub fn call_soon<F>(&self, f: F) -> Handler
    where
        F: FnOnce() + Send + 'static,
    {
        let handler = Handler::once(f);
        self.inner.push_ready(handler.clone());
        handler
    }

    /// Like [`EventLoop::call_soon`] but safe from any OS thread: the queue
    /// append is the only loop mutation, and the poller is woken through the
    /// waker so the callback runs promptly.
    pub fn call_from_thread<F>(&self, f: F) -> Handler
    where
        F: FnOnce() + Send + 'static,
    {
        let handler = Handler::once(f);
        self.inner.push_ready(handler.clone());
        if let Err(e) = self.inner.waker.wake() {
            debug!("waker wake failed => {e}");
        }
        handler
    }

    /// Run `f` once after `delay`. A zero delay degrades to
    /// [`EventLoop::call_soon`].
    pub fn call_later<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let handler = Handler::once(f);
        if delay.is_zero() {
            self.inner.push_ready(handler.clone());
            return Timer::unscheduled(handler);
        }
        self.inner.schedule_timer(handler, delay, None)
    }

    /// Run `f` every `interval`, which must be non-zero.
    pub fn call_repeatedly<F>(&self, interval: Duration, f: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        assert!(!interval.is_zero(), "repeat interval must be positive");
        let handler = Handler::repeat(f);
        self.inner.schedule_timer(handler, interval, Some(interval))
    }

    /// Run `f` once at the instant `when` (in [`EventLoop::time`] units).
    pub fn call_at<F>(&self, when: Instant, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_later(when.saturating_duration_since(self.time()), f)
    }

    // I/O registration

    /// Register `f` to run whenever `fd` is readable. At most one reader per
    /// fd; a second registration is an error.
    pub fn add_reader<F>(&self, fd: RawFd, f: F) -> Result<Handler, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        let handler = Handler::repeat(f);
        let mut state = self.inner.state.lock();
        let poll_state = state.fd_map.entry(fd).or_insert_with(PollState::empty);
        if poll_state.read_handler.is_some() {
            return Err(LoopError::ReaderRegistered(fd));
        }
        let had = poll_state.mask;
        poll_state.mask |= PollEvents::READABLE;
        poll_state.read_handler = Some(handler.clone());
        let mask = poll_state.mask;
        drop(state);
        if let Err(e) = self.inner.arm_fd(fd, had, mask) {
            let mut state = self.inner.state.lock();
            self.inner.remove_direction(&mut state, fd, PollEvents::READABLE);
            return Err(e);
        }
        Ok(handler)
    }

    /// Drop the reader for `fd`, cancelling its handler. Returns whether a
    /// reader was registered.
    pub fn remove_reader(&self, fd: RawFd) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.remove_direction(&mut state, fd, PollEvents::READABLE)
    }

    /// Register `f` to run whenever `fd` is writable. At most one writer per
    /// fd; a second registration is an error.
    pub fn add_writer<F>(&self, fd: RawFd, f: F) -> Result<Handler, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        let handler = Handler::repeat(f);
        let mut state = self.inner.state.lock();
        let poll_state = state.fd_map.entry(fd).or_insert_with(PollState::empty);
        if poll_state.write_handler.is_some() {
            return Err(LoopError::WriterRegistered(fd));
        }
        let had = poll_state.mask;
        poll_state.mask |= PollEvents::WRITABLE;
        poll_state.write_handler = Some(handler.clone());
        let mask = poll_state.mask;
        drop(state);
        if let Err(e) = self.inner.arm_fd(fd, had, mask) {
            let mut state = self.inner.state.lock();
            self.inner.remove_direction(&mut state, fd, PollEvents::WRITABLE);
            return Err(e);
        }
        Ok(handler)
    }

    /// Drop the writer for `fd`, cancelling its handler. Returns whether a
    /// writer was registered.
    pub fn remove_writer(&self, fd: RawFd) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.remove_direction(&mut state, fd, PollEvents::WRITABLE)
    }

    // signals

    /// Register `f` for deliveries of `sig`. Several handlers may coexist for
    /// one signal; each delivery fires all of them. Signal registrations do
    /// not by themselves keep the loop alive.
    pub fn add_signal_handler<F>(&self, sig: i32, f: F) -> Result<SignalHandler, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        if !(1..NSIG).contains(&sig) {
            return Err(LoopError::BadSignal(sig));
        }
        {
            let mut signals = self.inner.signals.lock();
            match signals.as_mut() {
                Some(signals) => signals
                    .add_signal(sig)
                    .map_err(|_| LoopError::BadSignal(sig))?,
                None => return Err(LoopError::Destroyed),
            }
        }
        let handler = Handler::repeat(f);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .signal_map
            .entry(sig)
            .or_default()
            .push((id, handler.clone()));
        Ok(SignalHandler {
            handler,
            sig,
            id,
            lp: Arc::downgrade(&self.inner),
        })
    }

    /// Remove every handler registered for `sig`. Returns whether any were.
    pub fn remove_signal_handler(&self, sig: i32) -> bool {
        let mut state = self.inner.state.lock();
        match state.signal_map.remove(&sig) {
            Some(handlers) => {
                for (_, handler) in &handlers {
                    handler.cancel();
                }
                !handlers.is_empty()
            }
            None => false,
        }
    }

    // fiber hand-off

    /// Suspend the calling task fiber until a loop-side callback resumes it.
    /// The caller must have registered a resumer first; this is the single
    /// suspension primitive every blocking operation funnels through.
    ///
    /// Before the loop has been started this degrades to running it: the
    /// creating thread blocks in the reactor until the registered resumer
    /// (along with everything else) has been processed and the loop runs dry.
    pub fn switch(&self) -> Result<(), Interrupt> {
        if !self.inner.started.load(Ordering::SeqCst) {
            let _ = self.run();
            return Ok(());
        }
        let current = Fiber::current();
        assert!(
            !current.is(&self.inner.fiber),
            "cannot switch to the event loop from the loop fiber"
        );
        current.set_parent(&self.inner.fiber);
        self.inner.fiber.switch()
    }

    // run / stop / destroy

    /// Run the loop until it has no more active work or [`EventLoop::stop`]
    /// is called. May only be called once, from the creating thread.
    pub fn run(&self) -> Result<(), LoopError> {
        self.run_mode(false)
    }

    /// Like [`EventLoop::run`] but the loop stays alive with nothing to do,
    /// until stopped.
    pub fn run_forever(&self) -> Result<(), LoopError> {
        self.run_mode(true)
    }

    fn run_mode(&self, forever: bool) -> Result<(), LoopError> {
        if thread::current().id() != self.inner.creator_thread
            || !Fiber::current().is(&self.inner.creator)
        {
            return Err(LoopError::WrongThread);
        }
        if !self.inner.fiber.is_alive() {
            return Err(LoopError::Ended);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(LoopError::AlreadyStarted);
        }
        // A long-period repeating timer so the loop never drains to zero
        // active work in forever mode.
        let keepalive =
            forever.then(|| self.call_repeatedly(Duration::from_secs(24 * 3600), || {}));
        self.inner.running.store(true, Ordering::SeqCst);
        let _ = self.inner.fiber.switch();
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(keepalive) = keepalive {
            keepalive.cancel();
        }
        Ok(())
    }

    /// Request the loop to exit at the next iteration boundary.
    pub fn stop(&self) -> Result<(), LoopError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(LoopError::NotStarted);
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.waker.wake() {
            debug!("waker wake failed => {e}");
        }
        Ok(())
    }

    /// Tear the loop down: cancel timers, deregister every fd and signal,
    /// drop the poller and the thread-local reference. Must run outside the
    /// loop, on the creating thread.
    pub fn destroy(&self) -> Result<(), LoopError> {
        if self.is_running() {
            return Err(LoopError::Running);
        }
        if thread::current().id() != self.inner.creator_thread {
            return Err(LoopError::WrongThread);
        }
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(LoopError::Destroyed);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            // The loop fiber never ran; unpark its thread so it exits.
            self.inner.fiber.abort(Interrupt::TaskExit);
        }
        let mut state = self.inner.state.lock();
        for (_, entry) in state.timers.drain() {
            entry.handler.cancel();
        }
        state.schedule.clear();
        for (_, handlers) in state.signal_map.drain() {
            for (_, handler) in handlers {
                handler.cancel();
            }
        }
        let fds: Vec<RawFd> = state.fd_map.keys().copied().collect();
        for fd in fds {
            if let Some(poll_state) = state.fd_map.remove(&fd) {
                if let Some(handler) = poll_state.read_handler {
                    handler.cancel();
                }
                if let Some(handler) = poll_state.write_handler {
                    handler.cancel();
                }
                if let Err(e) = self.inner.registry.deregister(&mut SourceFd(&fd)) {
                    debug!(fd, "deregister on destroy failed => {e}");
                }
            }
        }
        for handler in state.ready.drain(..) {
            handler.cancel();
        }
        drop(state);
        *self.inner.signals.lock() = None;
        *self.inner.poller.lock() = None;
        *self.inner.threadpool.lock() = None;
        CURRENT_LOOP.with(|c| {
            let same = c
                .borrow()
                .as_ref()
                .map(|lp| Arc::ptr_eq(&lp.inner, &self.inner))
                .unwrap_or(false);
            if same {
                *c.borrow_mut() = None;
            }
        });
        Ok(())
    }

    /// The loop's blocking-work bridge, created on first use.
    pub fn threadpool(&self) -> ThreadPool {
        let mut pool = self.inner.threadpool.lock();
        match pool.as_ref() {
            Some(pool) => pool.clone(),
            None => {
                let created = ThreadPool::new(self.clone());
                *pool = Some(created.clone());
                created
            }
        }
    }

    pub(crate) fn work_started(&self) {
        self.inner.pending_work.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn work_finished(&self) {
        self.inner.pending_work.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PollState {
    fn empty() -> PollState {
        PollState {
            mask: PollEvents::empty(),
            read_handler: None,
            write_handler: None,
        }
    }
}

impl LoopInner {
    fn push_ready(&self, handler: Handler) {
        self.state.lock().ready.push_back(handler);
    }

    fn schedule_timer(
        self: &Arc<LoopInner>,
        handler: Handler,
        delay: Duration,
        period: Option<Duration>,
    ) -> Timer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        state.timers.insert(
            id,
            TimerEntry {
                handler: handler.clone(),
                period,
            },
        );
        state.schedule.insert((deadline, id), ());
        Timer {
            handler,
            id,
            lp: Arc::downgrade(self),
        }
    }

    /// Register or re-register `fd` with the poller after a mask change.
    fn arm_fd(&self, fd: RawFd, had: PollEvents, mask: PollEvents) -> Result<(), LoopError> {
        let interest = match mask.interest() {
            Some(interest) => interest,
            None => return Ok(()),
        };
        let result = if had.is_empty() {
            self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
        } else {
            self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        };
        result.map_err(LoopError::Io)
    }

    /// Clear one direction of an fd registration. Deregisters the fd when the
    /// mask empties, reregisters with the reduced mask otherwise.
    fn remove_direction(&self, state: &mut LoopState, fd: RawFd, dir: PollEvents) -> bool {
        let poll_state = match state.fd_map.get_mut(&fd) {
            Some(poll_state) => poll_state,
            None => return false,
        };
        let handler = if dir == PollEvents::READABLE {
            poll_state.read_handler.take()
        } else {
            poll_state.write_handler.take()
        };
        poll_state.mask &= !dir;
        let mask = poll_state.mask;
        if mask.is_empty() {
            state.fd_map.remove(&fd);
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                debug!(fd, "deregister failed => {e}");
            }
        } else if let Some(interest) = mask.interest() {
            if let Err(e) = self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest) {
                debug!(fd, "reregister failed => {e}");
            }
        }
        match handler {
            Some(handler) => {
                handler.cancel();
                true
            }
            None => false,
        }
    }

    /// Readiness dispatch for one fd, mirroring the poll-callback contract:
    /// cancelled directions are removed on the spot, readiness for a
    /// masked-out direction clears the mask bit, and a surviving mask change
    /// reregisters the fd. A poller-level error wakes both live handlers so
    /// waiting fibers observe the failure through their primitive.
    fn poll_callback(&self, fd: RawFd, readable: bool, writable: bool, errored: bool) {
        let mut state = self.state.lock();
        let poll_state = match state.fd_map.get_mut(&fd) {
            Some(poll_state) => poll_state,
            None => return,
        };
        if errored {
            let fire: Vec<Handler> = [
                poll_state.read_handler.clone(),
                poll_state.write_handler.clone(),
            ]
            .into_iter()
            .flatten()
            .filter(|handler| !handler.is_cancelled())
            .collect();
            let drop_read = poll_state
                .read_handler
                .as_ref()
                .is_some_and(Handler::is_cancelled);
            let drop_write = poll_state
                .write_handler
                .as_ref()
                .is_some_and(Handler::is_cancelled);
            if drop_read {
                self.remove_direction(&mut state, fd, PollEvents::READABLE);
            }
            if drop_write {
                self.remove_direction(&mut state, fd, PollEvents::WRITABLE);
            }
            state.ready.extend(fire);
            return;
        }

        let old = poll_state.mask;
        let mut modified = false;
        let mut fire = Vec::new();

        if readable {
            match &poll_state.read_handler {
                Some(handler) if handler.is_cancelled() => {
                    self.clear_direction(poll_state, PollEvents::READABLE);
                    modified = true;
                }
                Some(handler) => fire.push(handler.clone()),
                None => poll_state.mask &= !PollEvents::READABLE,
            }
        }
        if writable {
            match &poll_state.write_handler {
                Some(handler) if handler.is_cancelled() => {
                    self.clear_direction(poll_state, PollEvents::WRITABLE);
                    modified = true;
                }
                Some(handler) => fire.push(handler.clone()),
                None => poll_state.mask &= !PollEvents::WRITABLE,
            }
        }

        let mask = poll_state.mask;
        if mask.is_empty() {
            state.fd_map.remove(&fd);
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                debug!(fd, "deregister failed => {e}");
            }
        } else if !modified && old != mask {
            if let Some(interest) = mask.interest() {
                if let Err(e) =
                    self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                {
                    debug!(fd, "reregister failed => {e}");
                }
            }
        }
        state.ready.extend(fire);
    }

    fn clear_direction(&self, poll_state: &mut PollState, dir: PollEvents) {
        if dir == PollEvents::READABLE {
            poll_state.read_handler = None;
        } else {
            poll_state.write_handler = None;
        }
        poll_state.mask &= !dir;
    }

    /// Invoke a snapshot of the ready queue: exactly the handlers that were
    /// queued when the drain began. Work queued by those callbacks runs on
    /// the next iteration, bounding re-entrancy.
    fn drain_ready(&self) {
        let todo = self.state.lock().ready.len();
        for _ in 0..todo {
            let handler = match self.state.lock().ready.pop_front() {
                Some(handler) => handler,
                None => break,
            };
            if handler.is_cancelled() {
                continue;
            }
            // The error hook: a callback failure must not take the loop down.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke())) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("unhandled panic in loop callback => {message}");
            }
        }
    }

    /// Fire every timer whose deadline has passed, rescheduling repeating
    /// ones. Cancelled entries are dropped without firing.
    fn fire_timers(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        while let Some((&(deadline, id), _)) = state.schedule.first_key_value() {
            if deadline > now {
                break;
            }
            state.schedule.pop_first();
            let entry = match state.timers.get(&id) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.handler.is_cancelled() {
                state.timers.remove(&id);
                continue;
            }
            let handler = entry.handler.clone();
            let period = entry.period;
            state.ready.push_back(handler);
            match period {
                Some(period) => {
                    state.schedule.insert((now + period, id), ());
                }
                None => {
                    state.timers.remove(&id);
                }
            }
        }
    }

    /// Zero while callbacks are queued; otherwise the gap to the nearest
    /// timer deadline; `None` (block until woken) when only fds or offloaded
    /// work remain.
    fn next_poll_timeout(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        if !state.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        while let Some((&(deadline, id), _)) = state.schedule.first_key_value() {
            if state.timers.contains_key(&id) {
                return Some(deadline.saturating_duration_since(Instant::now()));
            }
            state.schedule.pop_first();
        }
        None
    }

    fn has_active(&self) -> bool {
        if self.pending_work.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let state = self.state.lock();
        !state.ready.is_empty() || !state.fd_map.is_empty() || !state.timers.is_empty()
    }

    fn dispatch_signals(&self) {
        let pending: Vec<i32> = match self.signals.lock().as_mut() {
            Some(signals) => signals.pending().collect(),
            None => return,
        };
        let mut state = self.state.lock();
        for sig in pending {
            if let Some(handlers) = state.signal_map.get(&sig) {
                let fire: Vec<Handler> = handlers
                    .iter()
                    .filter(|(_, handler)| !handler.is_cancelled())
                    .map(|(_, handler)| handler.clone())
                    .collect();
                state.ready.extend(fire);
            }
        }
    }

    /// The loop fiber body: one reactor invocation, until stopped or idle.
    fn run_reactor(self: &Arc<LoopInner>) {
        let mut poller = match self.poller.lock().take() {
            Some(poller) => poller,
            None => return,
        };
        loop {
            self.drain_ready();
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if !self.has_active() {
                break;
            }
            let timeout = self.next_poll_timeout();
            let woke = match poller.poll(timeout) {
                Ok(woke) => woke,
                Err(e) => {
                    error!("poller failure, stopping loop => {e}");
                    break;
                }
            };
            for wake in woke {
                match wake {
                    Wake::Signals => self.dispatch_signals(),
                    Wake::Fd(ready) => {
                        self.poll_callback(ready.fd, ready.readable, ready.writable, ready.error)
                    }
                }
            }
            self.fire_timers();
            self.drain_ready();
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
        }
        *self.poller.lock() = Some(poller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_loop_singleton_per_thread() {
        let lp = EventLoop::new().unwrap();
        assert!(matches!(EventLoop::new(), Err(LoopError::Exists)));
        lp.destroy().unwrap();
        // After destroy the slot frees up again.
        let lp = EventLoop::new().unwrap();
        lp.destroy().unwrap();
    }

    #[test]
    fn test_call_soon_fifo_and_cancel() {
        let lp = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            lp.call_soon(move || order.lock().push(i));
        }
        let skipped = Arc::new(AtomicUsize::new(0));
        let observed = skipped.clone();
        let handler = lp.call_soon(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        handler.cancel();
        lp.run().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        lp.destroy().unwrap();
    }

    #[test]
    fn test_call_later_degrades_to_soon() {
        let lp = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let timer = lp.call_later(Duration::ZERO, move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!timer.is_pending());
        lp.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        lp.destroy().unwrap();
    }

    #[test]
    fn test_timer_cancel_releases_loop() {
        let lp = EventLoop::new().unwrap();
        let timer = lp.call_later(Duration::from_secs(3600), || {
            unreachable!("cancelled timer fired")
        });
        assert!(timer.is_pending());
        timer.cancel();
        assert!(!timer.is_pending());
        let started = Instant::now();
        lp.run().unwrap();
        // Nothing active: the loop exits immediately instead of waiting for
        // the cancelled deadline.
        assert!(started.elapsed() < Duration::from_secs(1));
        lp.destroy().unwrap();
    }

    #[test]
    fn test_run_twice_is_an_error() {
        let lp = EventLoop::new().unwrap();
        lp.run().unwrap();
        // The loop fiber has finished, so a second invocation reports the
        // loop as ended.
        assert!(matches!(lp.run(), Err(LoopError::Ended)));
        lp.destroy().unwrap();
    }

    #[test]
    fn test_destroy_twice_is_an_error() {
        let lp = EventLoop::new().unwrap();
        lp.destroy().unwrap();
        assert!(matches!(lp.destroy(), Err(LoopError::Destroyed)));
    }

    #[test]
    fn test_second_reader_for_fd_is_rejected() {
        use std::os::unix::io::AsRawFd;

        let lp = EventLoop::new().unwrap();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = socket.as_raw_fd();

        lp.add_reader(fd, || {}).unwrap();
        assert!(matches!(
            lp.add_reader(fd, || {}),
            Err(LoopError::ReaderRegistered(_))
        ));
        // A writer on the same fd is a separate slot.
        lp.add_writer(fd, || {}).unwrap();
        assert!(lp.remove_reader(fd));
        // With the reader gone, registration works again.
        lp.add_reader(fd, || {}).unwrap();
        assert!(lp.remove_reader(fd));
        assert!(lp.remove_writer(fd));
        assert!(!lp.remove_writer(fd));
        lp.destroy().unwrap();
    }
}
