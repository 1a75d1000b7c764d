//! timeout
//!
//! A scoped guard that throws into the current fiber after a delay. The
//! interrupt carries the guard's identity so nested scopes can tell their own
//! expiry from an outer one.

use crate::event_loop::{EventLoop, Timer};
use crate::fiber::{Fiber, Interrupt, TimeoutId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TIMEOUT_ID: AtomicU64 = AtomicU64::new(1);

/// Raises an interrupt in the current fiber after `seconds`.
///
/// With `None` the guard is "fake": it never fires and only exists so call
/// sites can treat optional deadlines uniformly. With an interrupt supplied
/// via [`Timeout::with_interrupt`] the victim observes that interrupt instead
/// of the guard's own identity.
pub struct Timeout {
    seconds: Option<Duration>,
    interrupt: Option<Interrupt>,
    id: TimeoutId,
    timer: Option<Timer>,
}

impl Timeout {
    pub fn new(seconds: Option<Duration>) -> Timeout {
        Timeout {
            seconds,
            interrupt: None,
            id: NEXT_TIMEOUT_ID.fetch_add(1, Ordering::Relaxed),
            timer: None,
        }
    }

    /// A timeout that delivers `interrupt` instead of its own identity.
    pub fn with_interrupt(seconds: Option<Duration>, interrupt: Interrupt) -> Timeout {
        Timeout {
            seconds,
            interrupt: Some(interrupt),
            id: NEXT_TIMEOUT_ID.fetch_add(1, Ordering::Relaxed),
            timer: None,
        }
    }

    /// Arm the timer. Restarting an armed timeout is a programming error;
    /// cancel it first.
    pub fn start(&mut self) {
        assert!(!self.is_pending(), "timeout is already started");
        let seconds = match self.seconds {
            Some(seconds) => seconds,
            None => return,
        };
        let lp = EventLoop::current();
        let current = Fiber::current();
        let interrupt = self
            .interrupt
            .clone()
            .unwrap_or(Interrupt::Expired(self.id));
        self.timer = Some(lp.call_later(seconds, move || {
            let _ = current.throw(interrupt);
        }));
    }

    /// True while the underlying timer is scheduled to fire.
    pub fn is_pending(&self) -> bool {
        self.timer.as_ref().map(Timer::is_pending).unwrap_or(false)
    }

    /// Disarm. Call on every exit path when not using [`with_timeout`].
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Whether `interrupt` is this guard's own expiry.
    pub fn matches(&self, interrupt: &Interrupt) -> bool {
        matches!(interrupt, Interrupt::Expired(id) if *id == self.id)
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `f` under a deadline. Returns `Ok(None)` when the deadline fired,
/// `Ok(Some(value))` when `f` finished in time; interrupts other than this
/// scope's own expiry propagate unchanged. The timer is cancelled on every
/// path, so nesting works.
pub fn with_timeout<T, F>(seconds: Option<Duration>, f: F) -> Result<Option<T>, Interrupt>
where
    F: FnOnce() -> Result<T, Interrupt>,
{
    let mut guard = Timeout::new(seconds);
    guard.start();
    let out = f();
    guard.cancel();
    match out {
        Ok(value) => Ok(Some(value)),
        Err(interrupt) if guard.matches(&interrupt) => Ok(None),
        Err(interrupt) => Err(interrupt),
    }
}

/// Like [`with_timeout`] but expiry delivers `interrupt` to the body, which
/// therefore observes it as any other interrupt would be observed.
pub fn with_timeout_interrupt<T, F>(
    seconds: Option<Duration>,
    interrupt: Interrupt,
    f: F,
) -> Result<T, Interrupt>
where
    F: FnOnce() -> Result<T, Interrupt>,
{
    let mut guard = Timeout::with_interrupt(seconds, interrupt);
    guard.start();
    let out = f();
    guard.cancel();
    out
}
