//! channel
//!
//! Rendezvous and bounded-buffered hand-off between fibers. The rendezvous
//! form pairs exactly one sender with one receiver: `send` parks until the
//! value is taken, `recv` parks until a value arrives. The buffered form
//! queues up to `capacity` items and parks senders only when full. Errors can
//! be sent in place of values and re-surface at the receiving side.

use crate::fiber::{Interrupt, SharedError};
use crate::sync::{Condition, Event, Lock, Semaphore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The sending side shipped an error instead of a value.
    #[error("remote error => {0}")]
    Remote(SharedError),
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

type Item<T> = Result<T, SharedError>;

enum Flavor<T> {
    Rendezvous(Rendezvous<T>),
    Buffered(Buffered<T>),
}

/// A fiber-to-fiber channel. Clones share the channel; any number of senders
/// and receivers may use it, serialized internally.
pub struct Channel<T> {
    inner: Arc<Flavor<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Channel<T> {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

// One value in flight: senders serialize on `send_lock`, receivers on
// `recv_lock`, and the two events shuttle the slot between exactly one
// sender and one receiver at a time.
struct Rendezvous<T> {
    send_lock: Semaphore,
    recv_lock: Semaphore,
    new_data: Event,
    recv_data: Event,
    slot: Mutex<Option<Item<T>>>,
}

struct Buffered<T> {
    capacity: usize,
    lock: Arc<Lock>,
    not_empty: Condition,
    not_full: Condition,
    queue: Mutex<VecDeque<Item<T>>>,
}

impl<T: Send + 'static> Channel<T> {
    /// A strict rendezvous channel.
    pub fn new() -> Channel<T> {
        Channel {
            inner: Arc::new(Flavor::Rendezvous(Rendezvous {
                send_lock: Semaphore::new(1),
                recv_lock: Semaphore::new(1),
                new_data: Event::new(),
                recv_data: Event::new(),
                slot: Mutex::new(None),
            })),
        }
    }

    /// A buffered channel holding up to `capacity` items.
    pub fn with_capacity(capacity: usize) -> Channel<T> {
        assert!(capacity > 0, "buffered channel needs capacity > 0");
        let lock = Arc::new(Lock::new());
        Channel {
            inner: Arc::new(Flavor::Buffered(Buffered {
                capacity,
                not_empty: Condition::with_lock(lock.clone()),
                not_full: Condition::with_lock(lock.clone()),
                lock,
                queue: Mutex::new(VecDeque::new()),
            })),
        }
    }

    /// Hand `value` to a receiver, parking until it is consumed (rendezvous)
    /// or until buffer space frees up (buffered).
    pub fn send(&self, value: T) -> Result<(), Interrupt> {
        self.send_item(Ok(value))
    }

    /// Ship an error; the receiver observes it as [`ChannelError::Remote`].
    pub fn send_error(&self, error: SharedError) -> Result<(), Interrupt> {
        self.send_item(Err(error))
    }

    fn send_item(&self, item: Item<T>) -> Result<(), Interrupt> {
        match &*self.inner {
            Flavor::Rendezvous(chan) => chan.send(item),
            Flavor::Buffered(chan) => chan.send(item),
        }
    }

    /// Take the next value, parking until one arrives.
    pub fn recv(&self) -> Result<T, ChannelError> {
        let item = match &*self.inner {
            Flavor::Rendezvous(chan) => chan.recv()?,
            Flavor::Buffered(chan) => chan.recv()?,
        };
        item.map_err(ChannelError::Remote)
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Channel<T> {
        Channel::new()
    }
}

impl<T> Rendezvous<T> {
    fn send(&self, item: Item<T>) -> Result<(), Interrupt> {
        self.send_lock.acquire(true, None)?;
        let out = (|| {
            *self.slot.lock() = Some(item);
            self.new_data.set();
            self.recv_data.wait(None)?;
            self.recv_data.clear();
            Ok(())
        })();
        self.send_lock.release();
        out
    }

    fn recv(&self) -> Result<Item<T>, Interrupt> {
        self.recv_lock.acquire(true, None)?;
        let out = (|| {
            self.new_data.wait(None)?;
            let item = self
                .slot
                .lock()
                .take()
                .expect("rendezvous slot empty after new-data event");
            self.new_data.clear();
            self.recv_data.set();
            Ok(item)
        })();
        self.recv_lock.release();
        out
    }
}

impl<T> Buffered<T> {
    fn send(&self, item: Item<T>) -> Result<(), Interrupt> {
        self.lock.acquire(true, None)?;
        let out = (|| {
            loop {
                if self.queue.lock().len() < self.capacity {
                    break;
                }
                self.not_full.wait(None)?;
            }
            self.queue.lock().push_back(item);
            self.not_empty.notify(1);
            Ok(())
        })();
        self.lock.release();
        out
    }

    fn recv(&self) -> Result<Item<T>, Interrupt> {
        self.lock.acquire(true, None)?;
        let out = (|| {
            loop {
                if let Some(item) = self.queue.lock().pop_front() {
                    self.not_full.notify(1);
                    return Ok(item);
                }
                self.not_empty.wait(None)?;
            }
        })();
        self.lock.release();
        out
    }
}
