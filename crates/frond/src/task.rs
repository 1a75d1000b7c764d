//! task
//!
//! A named, joinable, killable user fiber parented under the loop fiber.
//! Tasks run until they suspend at a blocking primitive; the loop resumes
//! them from handlers it drains. Only loop-side handlers ever switch or
//! throw into a task fiber.

use crate::event_loop::{EventLoop, LoopError};
use crate::fiber::{Fiber, Interrupt};
use crate::sync::Event;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// What a task body returns. Suspension points yield `Err` when the task is
/// killed or an enclosing timeout fires, so `?` unwinds the body cleanly.
pub type TaskOutcome = Result<(), Interrupt>;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_name() -> String {
    format!("task-{}", NAME_COUNTER.fetch_add(1, Ordering::Relaxed))
}

type Target = Box<dyn FnOnce() -> TaskOutcome + Send + 'static>;

struct TaskInner {
    name: String,
    fiber: Fiber,
    started: AtomicBool,
    running: AtomicBool,
    exit_event: Event,
    // A kill delivered before the task first runs; the body is skipped.
    pending_kill: Mutex<Option<Interrupt>>,
}

/// Handle to a spawned (or not yet started) task. Clones share the task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

/// Create a task running `f` and schedule it. Control returns immediately;
/// the task runs at the next ready-queue drain.
pub fn spawn<F>(f: F) -> Task
where
    F: FnOnce() -> TaskOutcome + Send + 'static,
{
    let task = Task::new(None, f);
    task.inner.started.store(true, Ordering::SeqCst);
    task.schedule_first_resume();
    task
}

/// Yield to other runnable tasks until at least `duration` has elapsed.
/// `sleep(Duration::ZERO)` is a bare reschedule through the ready queue.
pub fn sleep(duration: Duration) -> Result<(), Interrupt> {
    let lp = EventLoop::current();
    let current = Fiber::current();
    assert!(
        !current.is(lp.loop_fiber()),
        "sleep() may only be called from a task"
    );
    let resume = current.clone();
    let timer = lp.call_later(duration, move || {
        let _ = resume.switch();
    });
    let parked = lp.switch();
    timer.cancel();
    parked
}

impl Task {
    /// Build a task without scheduling it; pair with [`Task::start`].
    pub fn new<F>(name: Option<&str>, f: F) -> Task
    where
        F: FnOnce() -> TaskOutcome + Send + 'static,
    {
        let lp = EventLoop::current();
        let name = name.map(str::to_string).unwrap_or_else(next_name);
        let exit_event = Event::new();

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<TaskInner>| {
            let weak = weak.clone();
            let lp_for_fiber = lp.clone();
            let target: Target = Box::new(f);
            let fiber = Fiber::spawn(&name, Some(lp.loop_fiber().clone()), move || {
                EventLoop::enter(&lp_for_fiber);
                if let Some(inner) = weak.upgrade() {
                    Task { inner }.run(target);
                }
            });
            TaskInner {
                name,
                fiber,
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                exit_event,
                pending_kill: Mutex::new(None),
            }
        });
        Task { inner }
    }

    /// Schedule the first resume. A second start is an error.
    pub fn start(&self) -> Result<(), LoopError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(LoopError::TaskStarted);
        }
        self.schedule_first_resume();
        Ok(())
    }

    fn schedule_first_resume(&self) {
        let fiber = self.inner.fiber.clone();
        EventLoop::current().call_soon(move || {
            let _ = fiber.switch();
        });
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_alive(&self) -> bool {
        self.inner.fiber.is_alive()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait for the task to end. `Ok(true)` once it has; `Ok(false)` if the
    /// timeout elapses first.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, Interrupt> {
        assert!(
            self.inner.started.load(Ordering::SeqCst),
            "cannot join a task before it is started"
        );
        self.inner.exit_event.wait(timeout)
    }

    /// Terminate the task by raising [`Interrupt::TaskExit`] at its next
    /// suspension point.
    pub fn kill(&self) {
        self.kill_with(Interrupt::TaskExit)
    }

    /// Terminate the task with a caller-chosen interrupt. A task that never
    /// started has its body skipped; a finished task is left alone.
    pub fn kill_with(&self, interrupt: Interrupt) {
        if !self.is_alive() {
            return;
        }
        if !self.is_running() {
            // The fiber has not entered its body yet: record the interrupt
            // and let the wrapper skip the target when it is first resumed.
            *self.inner.pending_kill.lock() = Some(interrupt);
            return;
        }
        let fiber = self.inner.fiber.clone();
        EventLoop::current().call_soon(move || {
            let _ = fiber.throw(interrupt);
        });
    }

    // The body wrapper: runs the target with the kill/panic policy and
    // always sets the exit event so joiners wake.
    fn run(&self, target: Target) {
        let killed = self.inner.pending_kill.lock().take();
        if killed.is_some() {
            debug!(task = %self.inner.name, "killed before start");
            self.inner.exit_event.set();
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        match panic::catch_unwind(AssertUnwindSafe(target)) {
            Ok(Ok(())) => {}
            Ok(Err(Interrupt::TaskExit)) => {
                debug!(task = %self.inner.name, "task exit");
            }
            Ok(Err(interrupt)) => {
                error!(task = %self.inner.name, "task died => {interrupt}");
            }
            Err(_) => {
                error!(task = %self.inner.name, "task panicked");
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.exit_event.set();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.inner.exit_event.is_set() {
            "ended"
        } else if self.is_running() {
            "running"
        } else if self.inner.started.load(Ordering::SeqCst) {
            "started"
        } else {
            "initial"
        };
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("status", &status)
            .finish()
    }
}
