//! io
//!
//! Byte-stream I/O on top of the loop's readiness dispatch: the bounded read
//! buffer, the stream core shared by every transport, and the TCP, pipe and
//! UDP carriers. Fibers park per fd through [`wait_readable`] /
//! [`wait_writable`]; loop-side flush handlers push queued writes out in the
//! background.

pub mod buffer;
pub mod pipe;
pub mod stream;
pub mod tcp;
pub mod udp;

use crate::event_loop::{EventLoop, LoopError};
use crate::fiber::{Fiber, Interrupt};
use buffer::BufferFull;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
    #[error("server is closed")]
    ServerClosed,
    #[error("already connected")]
    AlreadyConnected,
    #[error(transparent)]
    BufferFull(#[from] BufferFull),
    #[error("io error => {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Registration(#[from] LoopError),
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

/// Park the calling fiber until `fd` reports readable. The registration is
/// removed on every exit path.
pub(crate) fn wait_readable(lp: &EventLoop, fd: RawFd) -> Result<(), StreamError> {
    let resume = Fiber::current();
    lp.add_reader(fd, move || {
        let _ = resume.switch();
    })?;
    let parked = lp.switch();
    lp.remove_reader(fd);
    parked?;
    Ok(())
}

/// Park the calling fiber until `fd` reports writable. The registration is
/// removed on every exit path.
pub(crate) fn wait_writable(lp: &EventLoop, fd: RawFd) -> Result<(), StreamError> {
    let resume = Fiber::current();
    lp.add_writer(fd, move || {
        let _ = resume.switch();
    })?;
    let parked = lp.switch();
    lp.remove_writer(fd);
    parked?;
    Ok(())
}
