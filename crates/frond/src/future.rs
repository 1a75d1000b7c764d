//! future
//!
//! One-shot value/error carriers with the five-state machine, done-callbacks,
//! and the waiter protocol behind the multi-future combinators [`wait`] and
//! [`as_completed`]. A future's state is guarded by its own cooperative
//! [`Condition`]; combinators acquire the conditions of all involved futures
//! in address order, so concurrent multi-future waits cannot deadlock.

use crate::channel::{Channel, ChannelError};
use crate::fiber::{Interrupt, SharedError};
use crate::sync::Condition;
use crate::task::{spawn, Task, TaskOutcome};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FutureError {
    #[error("future was cancelled")]
    Cancelled,
    #[error("operation exceeded the given deadline")]
    Timeout,
    #[error("future failed => {0}")]
    Failed(SharedError),
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

/// When a multi-future [`wait`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWhen {
    FirstCompleted,
    FirstException,
    AllCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Cancelled,
    CancelledNotified,
    Finished,
}

struct Shared<T> {
    state: State,
    result: Option<Result<T, SharedError>>,
    callbacks: Vec<Box<dyn FnOnce(Future<T>) + Send>>,
    waiters: Vec<Arc<Waiter<T>>>,
}

struct FutureInner<T> {
    condition: Condition,
    shared: Mutex<Shared<T>>,
}

/// A one-shot result carrier. Handles are cheap clones sharing the state.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Future<T> {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    pub fn new() -> Future<T> {
        Future {
            inner: Arc::new(FutureInner {
                condition: Condition::new(),
                shared: Mutex::new(Shared {
                    state: State::Pending,
                    result: None,
                    callbacks: Vec::new(),
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    fn same(&self, other: &Future<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.shared.lock().state,
            State::Cancelled | State::CancelledNotified
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.inner.shared.lock().state,
            State::Cancelled | State::CancelledNotified | State::Finished
        )
    }

    /// Cancel a pending future. Fails (returns `Ok(false)`) once it is
    /// running or finished.
    pub fn cancel(&self) -> Result<bool, Interrupt> {
        let cancelled = self.inner.condition.with(|| {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                State::Running | State::Finished => return Ok(false),
                State::Cancelled | State::CancelledNotified => return Ok(true),
                State::Pending => {}
            }
            shared.state = State::Cancelled;
            drop(shared);
            self.inner.condition.notify_all();
            Ok(true)
        })?;
        if cancelled {
            self.run_callbacks();
        }
        Ok(cancelled)
    }

    /// Consumer hand-shake: move `Pending` to `Running` and return `true`,
    /// or acknowledge a cancellation (`CancelledNotified`, waiters told) and
    /// return `false`. Any other state is a caller bug.
    pub fn set_running_or_notify_cancel(&self) -> Result<bool, Interrupt> {
        self.inner.condition.with(|| {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                State::Cancelled => {
                    shared.state = State::CancelledNotified;
                    let waiters = shared.waiters.clone();
                    drop(shared);
                    for waiter in waiters {
                        waiter.add_cancelled(self.clone());
                    }
                    Ok(false)
                }
                State::Pending => {
                    shared.state = State::Running;
                    Ok(true)
                }
                state => panic!("future in unexpected state: {state:?}"),
            }
        })
    }

    /// Finish with a value, waking waiters and firing callbacks.
    pub fn set_result(&self, value: T) -> Result<(), Interrupt> {
        self.finish(Ok(value))
    }

    /// Finish with an error, waking waiters and firing callbacks.
    pub fn set_error(&self, error: SharedError) -> Result<(), Interrupt> {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<T, SharedError>) -> Result<(), Interrupt> {
        let failed = result.is_err();
        self.inner.condition.with(|| {
            let mut shared = self.inner.shared.lock();
            shared.result = Some(result);
            shared.state = State::Finished;
            let waiters = shared.waiters.clone();
            drop(shared);
            for waiter in waiters {
                if failed {
                    waiter.add_exception(self.clone());
                } else {
                    waiter.add_result(self.clone());
                }
            }
            self.inner.condition.notify_all();
            Ok(())
        })?;
        self.run_callbacks();
        Ok(())
    }

    /// Wait for the future and return its value. Distinguishes cancellation,
    /// deadline overrun, and stored failure.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        self.inner.condition.with(|| Ok(self.collect(timeout)))?
    }

    /// Like [`Future::get`] but a stored failure comes back as `Ok(Some(e))`
    /// rather than an error.
    pub fn error(&self, timeout: Option<Duration>) -> Result<Option<SharedError>, FutureError> {
        self.inner.condition.with(|| {
            Ok(match self.collect(timeout) {
                Ok(_) => Ok(None),
                Err(FutureError::Failed(e)) => Ok(Some(e)),
                Err(e) => Err(e),
            })
        })?
    }

    // Must hold the condition. One recheck after a single wait, per the
    // state-machine contract: every terminal transition notifies.
    fn collect(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        match self.peek() {
            Some(out) => return out,
            None => {}
        }
        self.inner.condition.wait(timeout)?;
        match self.peek() {
            Some(out) => out,
            None => Err(FutureError::Timeout),
        }
    }

    fn peek(&self) -> Option<Result<T, FutureError>> {
        let shared = self.inner.shared.lock();
        match shared.state {
            State::Cancelled | State::CancelledNotified => Some(Err(FutureError::Cancelled)),
            State::Finished => match &shared.result {
                Some(Ok(value)) => Some(Ok(value.clone())),
                Some(Err(error)) => Some(Err(FutureError::Failed(error.clone()))),
                None => Some(Err(FutureError::Cancelled)),
            },
            _ => None,
        }
    }

    /// Run `f` when the future reaches a terminal state; immediately if it
    /// already has.
    pub fn add_done_callback<F>(&self, f: F) -> Result<(), Interrupt>
    where
        F: FnOnce(Future<T>) + Send + 'static,
    {
        let mut slot = Some(f);
        self.inner.condition.with(|| {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                State::Cancelled | State::CancelledNotified | State::Finished => {}
                _ => {
                    if let Some(f) = slot.take() {
                        shared.callbacks.push(Box::new(f));
                    }
                }
            }
            Ok(())
        })?;
        // Still in the slot means the future was already terminal.
        if let Some(f) = slot.take() {
            f(self.clone());
        }
        Ok(())
    }

    fn run_callbacks(&self) {
        let callbacks = std::mem::take(&mut self.inner.shared.lock().callbacks);
        for callback in callbacks {
            callback(self.clone());
        }
    }

    fn attach_waiter(&self, waiter: &Arc<Waiter<T>>) {
        self.inner.shared.lock().waiters.push(waiter.clone());
    }

    fn detach_waiter(&self, waiter: &Arc<Waiter<T>>) {
        self.inner
            .shared
            .lock()
            .waiters
            .retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Future<T> {
        Future::new()
    }
}

// The waiter protocol: terminal transitions report into every installed
// waiter, which decides when its event fires.
enum WaiterKind {
    FirstCompleted,
    AllCompleted { stop_on_exception: bool },
    AsCompleted,
}

struct Waiter<T> {
    kind: WaiterKind,
    event: crate::sync::Event,
    state: Mutex<WaiterProgress<T>>,
}

struct WaiterProgress<T> {
    finished: Vec<Future<T>>,
    pending_calls: usize,
}

impl<T: Clone + Send + 'static> Waiter<T> {
    fn new(kind: WaiterKind, pending_calls: usize) -> Arc<Waiter<T>> {
        Arc::new(Waiter {
            kind,
            event: crate::sync::Event::new(),
            state: Mutex::new(WaiterProgress {
                finished: Vec::new(),
                pending_calls,
            }),
        })
    }

    fn add_result(&self, future: Future<T>) {
        self.record(future, false)
    }

    fn add_exception(&self, future: Future<T>) {
        self.record(future, true)
    }

    fn add_cancelled(&self, future: Future<T>) {
        self.record(future, false)
    }

    fn record(&self, future: Future<T>, failed: bool) {
        let mut state = self.state.lock();
        state.finished.push(future);
        match self.kind {
            WaiterKind::FirstCompleted | WaiterKind::AsCompleted => {
                drop(state);
                self.event.set();
            }
            WaiterKind::AllCompleted { stop_on_exception } => {
                if failed && stop_on_exception {
                    drop(state);
                    self.event.set();
                    return;
                }
                state.pending_calls -= 1;
                let done = state.pending_calls == 0;
                drop(state);
                if done {
                    self.event.set();
                }
            }
        }
    }

    fn take_finished(&self) -> Vec<Future<T>> {
        std::mem::take(&mut self.state.lock().finished)
    }
}

fn acquire_all<T: Clone + Send + 'static>(sorted: &[Future<T>]) -> Result<(), Interrupt> {
    for (i, future) in sorted.iter().enumerate() {
        if let Err(interrupt) = future.inner.condition.acquire() {
            for held in &sorted[..i] {
                held.inner.condition.release();
            }
            return Err(interrupt);
        }
    }
    Ok(())
}

fn release_all<T: Clone + Send + 'static>(sorted: &[Future<T>]) {
    for future in sorted {
        future.inner.condition.release();
    }
}

fn sorted_by_addr<T: Clone + Send + 'static>(fs: &[Future<T>]) -> Vec<Future<T>> {
    let mut sorted = fs.to_vec();
    sorted.sort_by_key(|f| f.addr());
    sorted
}

fn install_waiter<T: Clone + Send + 'static>(
    fs: &[Future<T>],
    return_when: ReturnWhen,
    as_completed: bool,
) -> Arc<Waiter<T>> {
    let kind = if as_completed {
        WaiterKind::AsCompleted
    } else {
        match return_when {
            ReturnWhen::FirstCompleted => WaiterKind::FirstCompleted,
            ReturnWhen::FirstException => WaiterKind::AllCompleted {
                stop_on_exception: true,
            },
            ReturnWhen::AllCompleted => WaiterKind::AllCompleted {
                stop_on_exception: false,
            },
        }
    };
    let pending = fs.iter().filter(|f| !f.is_done()).count();
    let waiter = Waiter::new(kind, pending);
    for future in fs {
        future.attach_waiter(&waiter);
    }
    waiter
}

/// Wait on several futures at once. Returns the `(done, not_done)`
/// partition observed when the return condition was met or the timeout
/// elapsed.
pub fn wait<T: Clone + Send + 'static>(
    fs: &[Future<T>],
    timeout: Option<Duration>,
    return_when: ReturnWhen,
) -> Result<(Vec<Future<T>>, Vec<Future<T>>), Interrupt> {
    let sorted = sorted_by_addr(fs);
    acquire_all(&sorted)?;
    let mut done: Vec<Future<T>> = fs.iter().filter(|f| f.is_done()).cloned().collect();
    let not_done: Vec<Future<T>> = fs.iter().filter(|f| !f.is_done()).cloned().collect();

    let satisfied = match return_when {
        ReturnWhen::FirstCompleted => !done.is_empty(),
        ReturnWhen::FirstException => done.iter().any(|f| {
            !f.is_cancelled()
                && matches!(f.inner.shared.lock().result, Some(Err(_)))
        }),
        ReturnWhen::AllCompleted => false,
    } || not_done.is_empty();

    if satisfied {
        release_all(&sorted);
        return Ok((done, not_done));
    }

    let waiter = install_waiter(fs, return_when, false);
    release_all(&sorted);

    let parked = waiter.event.wait(timeout);
    for future in fs {
        future.detach_waiter(&waiter);
    }
    parked?;

    for finished in waiter.take_finished() {
        if !done.iter().any(|f| f.same(&finished)) {
            done.push(finished);
        }
    }
    let not_done = fs
        .iter()
        .filter(|f| !done.iter().any(|d| d.same(f)))
        .cloned()
        .collect();
    Ok((done, not_done))
}

/// Iterator over futures in completion order. Yields an error item when the
/// overall deadline passes or the waiting fiber is interrupted; the waiter is
/// detached from every future when the iterator is dropped.
pub fn as_completed<T: Clone + Send + 'static>(
    fs: &[Future<T>],
    timeout: Option<Duration>,
) -> Result<AsCompleted<T>, Interrupt> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let sorted = sorted_by_addr(fs);
    acquire_all(&sorted)?;
    let ready: VecDeque<Future<T>> = fs.iter().filter(|f| f.is_done()).cloned().collect();
    let pending: Vec<Future<T>> = fs.iter().filter(|f| !f.is_done()).cloned().collect();
    let waiter = install_waiter(fs, ReturnWhen::AllCompleted, true);
    release_all(&sorted);
    Ok(AsCompleted {
        all: fs.to_vec(),
        ready,
        pending,
        waiter,
        deadline,
    })
}

pub struct AsCompleted<T: Clone + Send + 'static> {
    all: Vec<Future<T>>,
    ready: VecDeque<Future<T>>,
    pending: Vec<Future<T>>,
    waiter: Arc<Waiter<T>>,
    deadline: Option<Instant>,
}

impl<T: Clone + Send + 'static> Iterator for AsCompleted<T> {
    type Item = Result<Future<T>, FutureError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(future) = self.ready.pop_front() {
                self.pending.retain(|f| !f.same(&future));
                return Some(Ok(future));
            }
            if self.pending.is_empty() {
                return None;
            }
            let remaining = match self.deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Some(Err(FutureError::Timeout));
                    }
                    Some(deadline - now)
                }
            };
            match self.waiter.event.wait(remaining) {
                Err(interrupt) => return Some(Err(FutureError::Interrupted(interrupt))),
                Ok(false) => return Some(Err(FutureError::Timeout)),
                Ok(true) => {}
            }
            self.waiter.event.clear();
            for finished in self.waiter.take_finished() {
                self.ready.push_back(finished);
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for AsCompleted<T> {
    fn drop(&mut self) {
        for future in &self.all {
            future.detach_waiter(&self.waiter);
        }
    }
}

/// Something futures can be submitted to.
pub trait Executor {
    fn submit<T, F>(&self, f: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, SharedError> + Send + 'static;
}

type PoolWork = Box<dyn FnOnce() -> TaskOutcome + Send>;

struct TaskPoolInner {
    max_workers: usize,
    queue: Channel<Option<PoolWork>>,
    workers: Mutex<Vec<Task>>,
    shutdown: AtomicBool,
}

/// An [`Executor`] that runs work on a bounded crew of tasks draining a
/// shared queue. Work runs on the loop thread and may itself suspend.
#[derive(Clone)]
pub struct TaskPoolExecutor {
    inner: Arc<TaskPoolInner>,
}

impl TaskPoolExecutor {
    pub fn new(max_workers: usize) -> TaskPoolExecutor {
        assert!(max_workers > 0, "task pool needs at least one worker");
        TaskPoolExecutor {
            inner: Arc::new(TaskPoolInner {
                max_workers,
                queue: Channel::with_capacity(max_workers),
                workers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    fn adjust_worker_count(&self) {
        let mut workers = self.inner.workers.lock();
        if workers.len() >= self.inner.max_workers {
            return;
        }
        let queue = self.inner.queue.clone();
        let worker = spawn(move || {
            loop {
                match queue.recv() {
                    Ok(Some(work)) => work()?,
                    Ok(None) => {
                        // Shutdown marker: pass it along for the other
                        // workers before leaving.
                        queue.send(None)?;
                        return Ok(());
                    }
                    Err(ChannelError::Interrupted(interrupt)) => return Err(interrupt),
                    Err(e) => {
                        warn!("task pool worker queue failed => {e}");
                        return Ok(());
                    }
                }
            }
        });
        workers.push(worker);
    }

    /// Drain outstanding work and retire the workers. With `wait`, parks
    /// until every worker has exited.
    pub fn shutdown(&self, wait: bool) -> Result<(), Interrupt> {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            self.inner.queue.send(None)?;
        }
        if wait {
            let workers: Vec<Task> = self.inner.workers.lock().clone();
            for worker in workers {
                worker.join(None)?;
            }
        }
        Ok(())
    }
}

impl Executor for TaskPoolExecutor {
    fn submit<T, F>(&self, f: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, SharedError> + Send + 'static,
    {
        assert!(
            !self.inner.shutdown.load(Ordering::SeqCst),
            "cannot schedule new futures after shutdown"
        );
        let future = Future::new();
        let result = future.clone();
        let work: PoolWork = Box::new(move || {
            if !result.set_running_or_notify_cancel()? {
                return Ok(());
            }
            match f() {
                Ok(value) => result.set_result(value)?,
                Err(error) => result.set_error(error)?,
            }
            Ok(())
        });
        self.adjust_worker_count();
        // Parks when every worker is busy and the queue is full, which is
        // the back-pressure the task pool wants.
        if let Err(interrupt) = self.inner.queue.send(Some(work)) {
            warn!("task pool submit interrupted => {interrupt}");
        }
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_cancel_only_while_pending() {
        let future: Future<u32> = Future::new();
        assert!(future.cancel().unwrap());
        assert!(future.is_cancelled());
        // Cancelling twice stays true; the consumer handshake then reports
        // the cancellation instead of running.
        assert!(future.cancel().unwrap());
        assert!(!future.set_running_or_notify_cancel().unwrap());
    }

    #[test]
    fn test_future_running_blocks_cancel() {
        let future: Future<u32> = Future::new();
        assert!(future.set_running_or_notify_cancel().unwrap());
        assert!(!future.cancel().unwrap());
        future.set_result(7).unwrap();
        assert!(!future.cancel().unwrap());
        assert_eq!(future.get(None).unwrap(), 7);
    }

    #[test]
    fn test_future_error_is_not_raised_by_error_accessor() {
        let future: Future<u32> = Future::new();
        assert!(future.set_running_or_notify_cancel().unwrap());
        let error: SharedError = Arc::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "boom",
        ));
        future.set_error(error).unwrap();
        assert!(matches!(future.get(None), Err(FutureError::Failed(_))));
        assert!(future.error(None).unwrap().is_some());
    }

    #[test]
    fn test_done_callback_fires_immediately_on_terminal_future() {
        let future: Future<u32> = Future::new();
        future.set_running_or_notify_cancel().unwrap();
        future.set_result(1).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();
        future
            .add_done_callback(move |_| observed.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
