//! frond
//!
//! A cooperative single-threaded concurrency runtime: many logical flows of
//! control ("tasks") share one scheduling thread by voluntarily suspending
//! at I/O, timer and synchronization points. An [`EventLoop`] drives a mio
//! reactor (ready queue, timer set, fd readiness, signal dispatch,
//! cross-thread waker); tasks are fibers parented under the loop fiber, and
//! every blocking primitive funnels through one suspension point,
//! [`EventLoop::switch`].
//!
//! ```no_run
//! use frond::{spawn, sleep, EventLoop};
//! use std::time::Duration;
//!
//! let lp = EventLoop::new().unwrap();
//! spawn(|| {
//!     sleep(Duration::from_millis(10))?;
//!     println!("hello from a task");
//!     Ok(())
//! });
//! lp.run().unwrap();
//! lp.destroy().unwrap();
//! ```

pub mod channel;
pub mod event_loop;
pub mod fiber;
pub mod future;
pub mod io;
pub mod net;
pub mod sync;
pub mod task;
pub mod timeout;
pub mod work;

pub use channel::{Channel, ChannelError};
pub use event_loop::{EventLoop, Handler, LoopError, SignalHandler, Timer};
pub use fiber::{Fiber, Interrupt, SharedError};
pub use future::{as_completed, wait, Executor, Future, FutureError, ReturnWhen, TaskPoolExecutor};
pub use sync::{Barrier, BarrierError, BoundedSemaphore, Condition, Event, Lock, RLock, Semaphore};
pub use task::{sleep, spawn, Task, TaskOutcome};
pub use timeout::{with_timeout, with_timeout_interrupt, Timeout};
pub use work::ThreadPool;
