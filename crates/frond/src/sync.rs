//! sync
//!
//! Cooperative synchronization primitives. All of them share one discipline:
//! internal state lives behind a short-lived `parking_lot` lock that is never
//! held across a fiber switch, waiters park via `EventLoop::switch`, and
//! wakers run as loop-side callbacks scheduled with `call_soon`. Cleanup
//! (waiter removal, timeout cancellation) runs on every exit path, so an
//! interrupt delivered mid-wait leaves no trace behind.

use crate::event_loop::EventLoop;
use crate::fiber::{Fiber, FiberId, Interrupt};
use crate::timeout::Timeout;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A flag fibers can wait on. `set` wakes every fiber currently waiting;
/// `clear` rearms the event for reuse.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Mutex<EventState>>,
}

struct EventState {
    flag: bool,
    waiters: VecDeque<Fiber>,
}

impl Event {
    pub fn new() -> Event {
        Event {
            inner: Arc::new(Mutex::new(EventState {
                flag: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().flag
    }

    /// Raise the flag and schedule one notify pass for current waiters.
    pub fn set(&self) {
        let wake = {
            let mut state = self.inner.lock();
            state.flag = true;
            !state.waiters.is_empty()
        };
        if wake {
            let inner = self.inner.clone();
            EventLoop::current().call_soon(move || Event::notify_waiters(&inner));
        }
    }

    pub fn clear(&self) {
        self.inner.lock().flag = false;
    }

    /// Park until the flag is raised or `timeout` elapses. Returns the flag
    /// state at wakeup, so a timed-out wait reports `false`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        if self.is_set() {
            return Ok(true);
        }
        let lp = EventLoop::current();
        let current = Fiber::current();
        self.inner.lock().waiters.push_back(current.clone());
        let mut timer = Timeout::new(timeout);
        timer.start();
        let parked = lp.switch();
        timer.cancel();
        {
            let mut state = self.inner.lock();
            let id = current.id();
            state.waiters.retain(|w| w.id() != id);
        }
        match parked {
            Ok(()) => Ok(self.is_set()),
            Err(interrupt) if timer.matches(&interrupt) => Ok(self.is_set()),
            Err(interrupt) => Err(interrupt),
        }
    }

    fn notify_waiters(inner: &Arc<Mutex<EventState>>) {
        let snapshot: Vec<Fiber> = inner.lock().waiters.iter().cloned().collect();
        for waiter in snapshot {
            // A waiter may have removed itself (timeout, kill) since the
            // snapshot was taken; only fibers still registered are woken.
            let still_waiting = {
                let state = inner.lock();
                state.waiters.iter().any(|w| w.id() == waiter.id())
            };
            if still_waiting {
                let _ = waiter.switch();
            }
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

/// Counting semaphore with FIFO waiters. Each `release` schedules at most
/// one wakeup; chained releases wake chained waiters.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Mutex<SemState>>,
}

struct SemState {
    counter: usize,
    waiters: VecDeque<Fiber>,
}

impl Semaphore {
    pub fn new(value: usize) -> Semaphore {
        Semaphore {
            inner: Arc::new(Mutex::new(SemState {
                counter: value,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.inner.lock().counter
    }

    /// Take a permit without suspending; `false` when none is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock();
        if state.counter > 0 {
            state.counter -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, parking while none is available. Non-blocking mode and
    /// timeouts report failure as `Ok(false)`.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        let lp;
        let current;
        {
            let mut state = self.inner.lock();
            if state.counter > 0 {
                state.counter -= 1;
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            lp = EventLoop::current();
            current = Fiber::current();
            state.waiters.push_back(current.clone());
        }
        let mut timer = Timeout::new(timeout);
        timer.start();
        let outcome = loop {
            match lp.switch() {
                Err(interrupt) => break Err(interrupt),
                Ok(()) => {
                    let mut state = self.inner.lock();
                    if state.counter > 0 {
                        state.counter -= 1;
                        break Ok(true);
                    }
                }
            }
        };
        timer.cancel();
        {
            let mut state = self.inner.lock();
            let id = current.id();
            state.waiters.retain(|w| w.id() != id);
        }
        match outcome {
            Err(interrupt) if timer.matches(&interrupt) => Ok(false),
            outcome => outcome,
        }
    }

    /// Return a permit and wake one waiter, if any.
    pub fn release(&self) {
        let wake = {
            let mut state = self.inner.lock();
            state.counter += 1;
            !state.waiters.is_empty()
        };
        if wake {
            let inner = self.inner.clone();
            EventLoop::current().call_soon(move || Semaphore::notify_one(&inner));
        }
    }

    fn notify_one(inner: &Arc<Mutex<SemState>>) {
        let waiter = {
            let mut state = inner.lock();
            if state.counter > 0 {
                state.waiters.pop_front()
            } else {
                None
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.switch();
        }
    }
}

/// A [`Semaphore`] that refuses to grow past its initial permit count.
#[derive(Clone)]
pub struct BoundedSemaphore {
    sem: Semaphore,
    initial: usize,
}

impl BoundedSemaphore {
    pub fn new(value: usize) -> BoundedSemaphore {
        BoundedSemaphore {
            sem: Semaphore::new(value),
            initial: value,
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.sem.try_acquire()
    }

    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        self.sem.acquire(blocking, timeout)
    }

    /// Panics when releasing would exceed the initial permit count.
    pub fn release(&self) {
        assert!(
            self.sem.available() < self.initial,
            "semaphore released too many times"
        );
        self.sem.release()
    }
}

/// Saved ownership state a [`WaitLock`] hands out while a condition waits.
pub enum SavedState {
    Plain,
    Recursive { count: usize, owner: Option<FiberId> },
}

/// The lock face [`Condition`] needs: plain acquire/release plus the
/// save/restore pair used to drop the lock around a wait.
pub trait WaitLock: Send + Sync {
    fn acquire_lock(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt>;
    fn release_lock(&self);
    fn release_save(&self) -> SavedState;
    fn acquire_restore(&self, saved: SavedState) -> Result<(), Interrupt>;
    fn is_owned(&self) -> bool;
}

/// Mutual exclusion: a binary [`Semaphore`] with the lock face bolted on.
#[derive(Clone)]
pub struct Lock {
    sem: Semaphore,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            sem: Semaphore::new(1),
        }
    }

    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        self.sem.acquire(blocking, timeout)
    }

    pub fn try_acquire(&self) -> bool {
        self.sem.try_acquire()
    }

    pub fn release(&self) {
        self.sem.release()
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

impl WaitLock for Lock {
    fn acquire_lock(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        self.acquire(blocking, timeout)
    }

    fn release_lock(&self) {
        self.release()
    }

    fn release_save(&self) -> SavedState {
        self.release();
        SavedState::Plain
    }

    fn acquire_restore(&self, _saved: SavedState) -> Result<(), Interrupt> {
        self.acquire(true, None).map(|_| ())
    }

    fn is_owned(&self) -> bool {
        // Probe-based: a binary semaphore does not track its owner.
        if self.try_acquire() {
            self.release();
            false
        } else {
            true
        }
    }
}

/// Re-entrant lock owned by a fiber. Releasing while not the owner is a
/// programming error and panics.
#[derive(Clone)]
pub struct RLock {
    inner: Arc<RLockInner>,
}

struct RLockInner {
    block: Semaphore,
    state: Mutex<RLockState>,
}

struct RLockState {
    count: usize,
    owner: Option<FiberId>,
}

impl RLock {
    pub fn new() -> RLock {
        RLock {
            inner: Arc::new(RLockInner {
                block: Semaphore::new(1),
                state: Mutex::new(RLockState {
                    count: 0,
                    owner: None,
                }),
            }),
        }
    }

    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        let me = Fiber::current().id();
        {
            let mut state = self.inner.state.lock();
            if state.owner == Some(me) {
                state.count += 1;
                return Ok(true);
            }
        }
        let acquired = self.inner.block.acquire(blocking, timeout)?;
        if acquired {
            let mut state = self.inner.state.lock();
            state.owner = Some(me);
            state.count = 1;
        }
        Ok(acquired)
    }

    pub fn release(&self) {
        let me = Fiber::current().id();
        let unlock = {
            let mut state = self.inner.state.lock();
            assert!(
                state.owner == Some(me),
                "cannot release un-acquired lock"
            );
            state.count -= 1;
            if state.count == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };
        if unlock {
            self.inner.block.release();
        }
    }
}

impl Default for RLock {
    fn default() -> RLock {
        RLock::new()
    }
}

impl WaitLock for RLock {
    fn acquire_lock(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        self.acquire(blocking, timeout)
    }

    fn release_lock(&self) {
        self.release()
    }

    fn release_save(&self) -> SavedState {
        let mut state = self.inner.state.lock();
        let saved = SavedState::Recursive {
            count: state.count,
            owner: state.owner,
        };
        state.count = 0;
        state.owner = None;
        drop(state);
        self.inner.block.release();
        saved
    }

    fn acquire_restore(&self, saved: SavedState) -> Result<(), Interrupt> {
        self.inner.block.acquire(true, None)?;
        if let SavedState::Recursive { count, owner } = saved {
            let mut state = self.inner.state.lock();
            state.count = count;
            state.owner = owner;
        }
        Ok(())
    }

    fn is_owned(&self) -> bool {
        self.inner.state.lock().owner == Some(Fiber::current().id())
    }
}

/// Condition variable over any [`WaitLock`] (re-entrant by default). The
/// caller must hold the lock around `wait` and `notify`.
#[derive(Clone)]
pub struct Condition {
    lock: Arc<dyn WaitLock>,
    waiters: Arc<Mutex<Vec<Semaphore>>>,
}

impl Condition {
    pub fn new() -> Condition {
        Condition::with_lock(Arc::new(RLock::new()))
    }

    pub fn with_lock(lock: Arc<dyn WaitLock>) -> Condition {
        Condition {
            lock,
            waiters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn acquire(&self) -> Result<(), Interrupt> {
        self.lock.acquire_lock(true, None).map(|_| ())
    }

    pub fn release(&self) {
        self.lock.release_lock()
    }

    /// Acquire the lock, run `f`, release on every path.
    pub fn with<R>(&self, f: impl FnOnce() -> Result<R, Interrupt>) -> Result<R, Interrupt> {
        self.acquire()?;
        let out = f();
        self.release();
        out
    }

    /// Drop the lock, park until notified or timed out, retake the lock.
    /// `Ok(false)` means the wait timed out.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        assert!(self.lock.is_owned(), "cannot wait on un-acquired lock");
        let waiter = Semaphore::new(0);
        self.waiters.lock().push(waiter.clone());
        let saved = self.lock.release_save();
        let woken = waiter.acquire(true, timeout);
        self.lock.acquire_restore(saved)?;
        woken
    }

    /// Re-check `predicate` until it holds or the deadline passes.
    pub fn wait_for<P>(&self, mut predicate: P, timeout: Option<Duration>) -> Result<bool, Interrupt>
    where
        P: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if predicate() {
                return Ok(true);
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
            };
            self.wait(remaining)?;
        }
    }

    /// Wake up to `n` waiters, in arrival order.
    pub fn notify(&self, n: usize) {
        assert!(self.lock.is_owned(), "cannot notify on un-acquired lock");
        let chosen: Vec<Semaphore> = {
            let mut waiters = self.waiters.lock();
            let n = n.min(waiters.len());
            waiters.drain(..n).collect()
        };
        for waiter in chosen {
            waiter.release();
        }
    }

    pub fn notify_all(&self) {
        let count = self.waiters.lock().len();
        self.notify(count)
    }
}

impl Default for Condition {
    fn default() -> Condition {
        Condition::new()
    }
}

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("barrier is broken")]
    Broken,
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

// Barrier phases. Fibers are kept out while the previous cycle drains;
// resetting behaves like draining except leavers observe a broken barrier.
#[derive(Clone, Copy, PartialEq)]
enum BarrierPhase {
    Filling,
    Draining,
    Resetting,
    Broken,
}

struct BarrierState {
    phase: BarrierPhase,
    count: usize,
}

/// Cyclic barrier: `parties` fibers block in `wait` and are released
/// together once the last one arrives.
#[derive(Clone)]
pub struct Barrier {
    cond: Condition,
    state: Arc<Mutex<BarrierState>>,
    action: Option<Arc<dyn Fn() + Send + Sync>>,
    parties: usize,
    timeout: Option<Duration>,
}

impl Barrier {
    pub fn new(parties: usize) -> Barrier {
        Barrier::with_options(parties, None, None)
    }

    /// `action` runs in the last arriving fiber just before release;
    /// `timeout` is the default for `wait` calls that pass `None`.
    pub fn with_options(
        parties: usize,
        action: Option<Arc<dyn Fn() + Send + Sync>>,
        timeout: Option<Duration>,
    ) -> Barrier {
        assert!(parties > 0, "barrier needs at least one party");
        Barrier {
            cond: Condition::with_lock(Arc::new(Lock::new())),
            state: Arc::new(Mutex::new(BarrierState {
                phase: BarrierPhase::Filling,
                count: 0,
            })),
            action,
            parties,
            timeout,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn n_waiting(&self) -> usize {
        let state = self.state.lock();
        match state.phase {
            BarrierPhase::Filling => state.count,
            _ => 0,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().phase == BarrierPhase::Broken
    }

    /// Block until `parties` fibers have arrived. Returns this fiber's
    /// arrival index, `0..parties`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<usize, BarrierError> {
        let timeout = timeout.or(self.timeout);
        self.cond.acquire()?;
        let out = self.wait_locked(timeout);
        self.cond.release();
        out
    }

    fn wait_locked(&self, timeout: Option<Duration>) -> Result<usize, BarrierError> {
        self.enter()?;
        let index = {
            let mut state = self.state.lock();
            let index = state.count;
            state.count += 1;
            index
        };
        let out = if index + 1 == self.parties {
            self.release_parties()
        } else {
            self.wait_release(timeout)
        };
        {
            let mut state = self.state.lock();
            state.count -= 1;
            // The last fiber out of a draining or resetting barrier flips it
            // back to filling and wakes anyone queued for the next cycle.
            if state.count == 0
                && matches!(state.phase, BarrierPhase::Draining | BarrierPhase::Resetting)
            {
                state.phase = BarrierPhase::Filling;
                drop(state);
                self.cond.notify_all();
            }
        }
        out.map(|_| index)
    }

    // Block while the previous cycle drains; refuse a broken barrier.
    fn enter(&self) -> Result<(), BarrierError> {
        loop {
            let phase = self.state.lock().phase;
            match phase {
                BarrierPhase::Draining | BarrierPhase::Resetting => {
                    self.cond.wait(None)?;
                }
                BarrierPhase::Broken => return Err(BarrierError::Broken),
                BarrierPhase::Filling => return Ok(()),
            }
        }
    }

    // Last arriver: run the action and release everyone.
    fn release_parties(&self) -> Result<(), BarrierError> {
        if let Some(action) = &self.action {
            action();
        }
        self.state.lock().phase = BarrierPhase::Draining;
        self.cond.notify_all();
        Ok(())
    }

    // Park until released; timing out breaks the barrier for everyone.
    fn wait_release(&self, timeout: Option<Duration>) -> Result<(), BarrierError> {
        let state = self.state.clone();
        let released = self
            .cond
            .wait_for(move || state.lock().phase != BarrierPhase::Filling, timeout)?;
        if !released {
            self.break_barrier();
            return Err(BarrierError::Broken);
        }
        match self.state.lock().phase {
            BarrierPhase::Draining => Ok(()),
            _ => Err(BarrierError::Broken),
        }
    }

    /// Reset to the initial state; fibers currently waiting observe a broken
    /// barrier.
    pub fn reset(&self) -> Result<(), Interrupt> {
        self.cond.with(|| {
            {
                let mut state = self.state.lock();
                if state.count > 0 {
                    match state.phase {
                        BarrierPhase::Filling | BarrierPhase::Broken => {
                            state.phase = BarrierPhase::Resetting;
                        }
                        _ => {}
                    }
                } else {
                    state.phase = BarrierPhase::Filling;
                }
            }
            self.cond.notify_all();
            Ok(())
        })
    }

    /// Put the barrier into the broken state; all waiters fail.
    pub fn abort(&self) -> Result<(), Interrupt> {
        self.cond.with(|| {
            self.break_barrier();
            Ok(())
        })
    }

    fn break_barrier(&self) {
        self.state.lock().phase = BarrierPhase::Broken;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_set_wait_is_immediate() {
        let event = Event::new();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        // No waiters were registered, so this returns without a loop.
        assert!(event.wait(None).unwrap());
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn test_semaphore_counting() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.available(), 1);
        // acquires minus releases equals the drop in the counter
        assert!(sem.acquire(true, None).unwrap());
        assert!(!sem.acquire(false, None).unwrap());
    }

    #[test]
    #[should_panic(expected = "released too many times")]
    fn test_bounded_semaphore_over_release() {
        let sem = BoundedSemaphore::new(1);
        assert!(sem.try_acquire());
        sem.release();
        sem.release();
    }

    #[test]
    fn test_rlock_reentrancy() {
        let lock = RLock::new();
        assert!(lock.acquire(true, None).unwrap());
        assert!(lock.acquire(true, None).unwrap());
        lock.release();
        assert!(lock.is_owned());
        lock.release();
        assert!(!lock.is_owned());
    }

    #[test]
    #[should_panic(expected = "cannot release un-acquired lock")]
    fn test_rlock_release_unowned() {
        let lock = RLock::new();
        lock.release();
    }

    #[test]
    fn test_lock_probe_ownership() {
        let lock = Lock::new();
        assert!(!WaitLock::is_owned(&lock));
        assert!(lock.try_acquire());
        assert!(WaitLock::is_owned(&lock));
        lock.release();
    }
}
