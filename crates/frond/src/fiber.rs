//! fiber
//!
//! A stackful context with explicit switch semantics. Every fiber owns a real
//! stack (a dedicated OS thread) and a mailbox; a switch delivers a wakeup to
//! the target mailbox and parks the caller on its own, so exactly one fiber
//! makes progress at any instant. Cancellation travels as an [`Interrupt`]
//! delivered through the same mailbox: the victim's pending suspension
//! returns `Err(interrupt)` and the primitive unwinds with `?`.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::error;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
}

/// Identity of a fiber, stable for its whole lifetime.
pub type FiberId = u64;

/// Identity of a scoped timeout, carried by [`Interrupt::Expired`] so nested
/// timeout scopes can tell their own expiry apart from an outer one.
pub type TimeoutId = u64;

/// A shared handle to an error, cloneable across fibers and futures.
pub type SharedError = Arc<dyn error::Error + Send + Sync>;

/// The cancellation currency delivered by [`Fiber::throw`]. A suspended
/// primitive observes this as the `Err` arm of its park and propagates it
/// after running its cleanup.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Silent task termination, swallowed by the task wrapper.
    TaskExit,
    /// A scoped timeout fired. The id names which scope.
    Expired(TimeoutId),
    /// A caller-provided error thrown into the fiber.
    Other(SharedError),
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::TaskExit => write!(f, "task exit"),
            Interrupt::Expired(id) => write!(f, "timeout {id} expired"),
            Interrupt::Other(e) => write!(f, "interrupted => {e}"),
        }
    }
}

impl error::Error for Interrupt {}

/// What lands in a mailbox: either plain control transfer or an interrupt.
enum Wakeup {
    Resume,
    Interrupt(Interrupt),
}

struct Inner {
    id: FiberId,
    name: String,
    alive: AtomicBool,
    mailbox: Mutex<VecDeque<Wakeup>>,
    ready: Condvar,
    parent: Mutex<Option<Fiber>>,
}

/// A cheap handle to a fiber. Clones share identity.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Fiber {
    /// Spawn a new parked fiber. The body does not run until the fiber is
    /// first resumed with [`Fiber::switch`]. If the first thing delivered is
    /// an interrupt the body never runs and control is not handed anywhere.
    pub fn spawn<F>(name: &str, parent: Option<Fiber>, body: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::with_name(name, parent);
        let inner = fiber.clone();
        let builder = thread::Builder::new().name(name.to_string());
        let handle = builder.spawn(move || {
            CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));
            match inner.wait_wakeup() {
                Ok(()) => {
                    body();
                    let parent = inner.parent();
                    inner.inner.alive.store(false, Ordering::SeqCst);
                    // Hand control back to whoever this fiber answers to. The
                    // parent is parked in the switch that last resumed us.
                    if let Some(parent) = parent {
                        parent.deliver(Wakeup::Resume);
                    }
                }
                Err(_) => {
                    // Aborted before ever running. Nobody is parked waiting
                    // on us, so exit without a hand-off.
                    inner.inner.alive.store(false, Ordering::SeqCst);
                }
            }
        });
        if let Err(e) = handle {
            error!(name = %fiber.inner.name, "failed to spawn fiber thread => {e}");
            fiber.inner.alive.store(false, Ordering::SeqCst);
        }
        fiber
    }

    fn with_name(name: &str, parent: Option<Fiber>) -> Fiber {
        Fiber {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                alive: AtomicBool::new(true),
                mailbox: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                parent: Mutex::new(parent),
            }),
        }
    }

    /// The fiber the calling context runs on. Plain threads get a root fiber
    /// minted on first use; it represents the thread itself.
    pub fn current() -> Fiber {
        CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            match current.as_ref() {
                Some(fiber) => fiber.clone(),
                None => {
                    let name = thread::current()
                        .name()
                        .unwrap_or("root")
                        .to_string();
                    let fiber = Fiber::with_name(&name, None);
                    *current = Some(fiber.clone());
                    fiber
                }
            }
        })
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True from creation until the body has returned (or the fiber was
    /// aborted before its first resume).
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn parent(&self) -> Option<Fiber> {
        self.inner.parent.lock().clone()
    }

    /// Re-parent this fiber. Attempts that would create a parent cycle are
    /// ignored, as is re-assigning the parent it already has.
    pub fn set_parent(&self, parent: &Fiber) {
        if self.is(parent) {
            return;
        }
        // Walk up from the proposed parent; if we find ourselves the
        // assignment would close a cycle.
        let mut cursor = parent.parent();
        while let Some(above) = cursor {
            if above.is(self) {
                return;
            }
            cursor = above.parent();
        }
        *self.inner.parent.lock() = Some(parent.clone());
    }

    /// Resume `self`, parking the caller. The caller's own next resume
    /// becomes the return value: `Ok(())` for a plain switch, `Err` when
    /// something threw into it while it was parked.
    ///
    /// Switching to a finished fiber is a no-op and control stays with the
    /// caller (which is the parent in every legal call site).
    pub fn switch(&self) -> Result<(), Interrupt> {
        let current = Fiber::current();
        assert!(!current.is(self), "a fiber cannot switch to itself");
        if !self.is_alive() {
            return Ok(());
        }
        self.deliver(Wakeup::Resume);
        current.wait_wakeup()
    }

    /// Like [`Fiber::switch`] but the target's pending suspension observes
    /// `Err(interrupt)` instead of resuming normally.
    pub fn throw(&self, interrupt: Interrupt) -> Result<(), Interrupt> {
        let current = Fiber::current();
        assert!(!current.is(self), "a fiber cannot throw into itself");
        if !self.is_alive() {
            return Ok(());
        }
        self.deliver(Wakeup::Interrupt(interrupt));
        current.wait_wakeup()
    }

    /// Deliver an interrupt without parking the caller. Used for teardown of
    /// fibers that were never started; the dying fiber performs no hand-off.
    pub(crate) fn abort(&self, interrupt: Interrupt) {
        if self.is_alive() {
            self.deliver(Wakeup::Interrupt(interrupt));
        }
    }

    fn deliver(&self, wakeup: Wakeup) {
        let mut mailbox = self.inner.mailbox.lock();
        mailbox.push_back(wakeup);
        self.inner.ready.notify_one();
    }

    fn wait_wakeup(&self) -> Result<(), Interrupt> {
        let mut mailbox = self.inner.mailbox.lock();
        loop {
            match mailbox.pop_front() {
                Some(Wakeup::Resume) => return Ok(()),
                Some(Wakeup::Interrupt(i)) => return Err(i),
                None => self.inner.ready.wait(&mut mailbox),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_root_identity() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert!(a.is(&b));
        assert_eq!(a.id(), b.id());
        assert!(a.is_alive());
    }

    #[test]
    fn test_fiber_switch_round_trip() {
        let root = Fiber::current();
        let fiber = Fiber::spawn("worker", Some(root.clone()), move || {
            // Control arrives here on first switch and leaves when the body
            // returns; the spawning fiber resumes after the hand-off.
        });
        assert!(fiber.is_alive());
        fiber.switch().unwrap();
        assert!(!fiber.is_alive());
        // Switching to a finished fiber is a no-op.
        fiber.switch().unwrap();
    }

    #[test]
    fn test_fiber_throw_before_start_skips_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let observed = ran.clone();
        let fiber = Fiber::spawn("aborted", None, move || {
            observed.store(true, Ordering::SeqCst);
        });
        fiber.abort(Interrupt::TaskExit);
        while fiber.is_alive() {
            thread::yield_now();
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fiber_parent_cycle_tolerated() {
        let root = Fiber::current();
        let fiber = Fiber::spawn("child", Some(root.clone()), || {});
        // The root adopting its own descendant would close a cycle; the
        // assignment is silently skipped.
        root.set_parent(&fiber);
        assert!(root.parent().is_none());
        fiber.switch().unwrap();
    }
}
