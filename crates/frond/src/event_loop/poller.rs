//! poller
//!
//! Thin wrapper over the mio `Poll` that the loop fiber drives. Readiness is
//! classified by token: one reserved token for the cross-thread waker, one
//! for the signal pipe, everything else is a file descriptor registration.

use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);
pub(crate) const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness observed for one registered file descriptor.
pub(crate) struct FdReady {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub(crate) enum Wake {
    Fd(FdReady),
    Signals,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new() -> io::Result<(Poller, Registry, Waker)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let poller = Poller {
            poll,
            events: Events::with_capacity(1024),
        };
        Ok((poller, registry, waker))
    }

    /// Run one poll with the given timeout and classify what woke us.
    /// Spurious waker wakeups produce an empty set.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Wake>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }
        let mut woke = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                SIGNAL_TOKEN => woke.push(Wake::Signals),
                Token(fd) => woke.push(Wake::Fd(FdReady {
                    fd: fd as RawFd,
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable() || event.is_write_closed(),
                    error: event.is_error(),
                })),
            }
        }
        Ok(woke)
    }
}
