//! work
//!
//! The blocking-work bridge: hand a callable to an OS worker thread and
//! resume the calling fiber through a [`Future`] once it completes. Workers
//! never touch loop state directly; every future transition is marshalled to
//! the loop thread with `call_from_thread`, and in-flight work holds the loop
//! alive until its completion callback has run.

use crate::event_loop::EventLoop;
use crate::fiber::SharedError;
use crate::future::{Executor, Future};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

const DEFAULT_WORKERS: usize = 4;

#[derive(Debug)]
struct PanicError(String);

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker panicked => {}", self.0)
    }
}

impl std::error::Error for PanicError {}

type WorkFn = Box<dyn FnOnce() + Send>;

struct PoolInner {
    lp: EventLoop,
    queue: Sender<WorkFn>,
    feed: Receiver<WorkFn>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    max_workers: usize,
}

/// OS-thread worker pool owned by an event loop. Cheap to clone.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub(crate) fn new(lp: EventLoop) -> ThreadPool {
        ThreadPool::with_workers(lp, DEFAULT_WORKERS)
    }

    pub(crate) fn with_workers(lp: EventLoop, max_workers: usize) -> ThreadPool {
        let (queue, feed) = unbounded();
        ThreadPool {
            inner: Arc::new(PoolInner {
                lp,
                queue,
                feed,
                threads: Mutex::new(Vec::new()),
                max_workers: max_workers.max(1),
            }),
        }
    }

    /// Run `f` on a worker thread. The returned future finishes on the loop
    /// thread; a panic in `f` surfaces as a failure. Cancelling the future
    /// before a worker picks it up prevents `f` from running at all;
    /// cancelling once it runs is not attempted.
    pub fn spawn<T, F>(&self, f: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, SharedError> + Send + 'static,
    {
        let future = Future::new();
        let result = future.clone();
        let lp = self.inner.lp.clone();
        lp.work_started();

        let work: WorkFn = Box::new(move || {
            // Ask the loop thread whether we should run at all. A future
            // cancelled before this point ends cancelled-and-notified and
            // the callable never runs.
            let (tx, rx) = mpsc::channel();
            let gate = result.clone();
            lp.call_from_thread(move || {
                let running = gate.set_running_or_notify_cancel().unwrap_or(false);
                let _ = tx.send(running);
            });
            let running = rx.recv().unwrap_or(false);
            if !running {
                debug!("work item cancelled before start");
                lp.call_from_thread({
                    let lp = lp.clone();
                    move || lp.work_finished()
                });
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(Arc::new(PanicError(message)) as SharedError)
            });
            let lp_after = lp.clone();
            lp.call_from_thread(move || {
                let delivered = match outcome {
                    Ok(value) => result.set_result(value),
                    Err(error) => result.set_error(error),
                };
                if let Err(interrupt) = delivered {
                    warn!("work completion interrupted => {interrupt}");
                }
                lp_after.work_finished();
            });
        });

        self.adjust_thread_count();
        if self.inner.queue.send(work).is_err() {
            warn!("thread pool queue closed, dropping work item");
            self.inner.lp.work_finished();
        }
        future
    }

    fn adjust_thread_count(&self) {
        let mut threads = self.inner.threads.lock();
        if threads.len() >= self.inner.max_workers {
            return;
        }
        // Workers share one receiver; the queue closes when the pool drops.
        let feed = self.inner.feed.clone();
        let builder = thread::Builder::new().name(format!("frond-worker-{}", threads.len()));
        match builder.spawn(move || {
            while let Ok(work) = feed.recv() {
                work();
            }
        }) {
            Ok(handle) => threads.push(handle),
            Err(e) => warn!("failed to spawn worker thread => {e}"),
        }
    }
}

impl Executor for ThreadPool {
    fn submit<T, F>(&self, f: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, SharedError> + Send + 'static,
    {
        self.spawn(f)
    }
}
