//! udp
//!
//! Datagram endpoint: bound socket with parking send/receive. No stream
//! buffering applies; each receive yields one datagram.

use crate::event_loop::EventLoop;
use crate::io::{wait_readable, wait_writable, StreamError};
use bytes::Bytes;
use mio::net::UdpSocket;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const RECV_CHUNK_SIZE: usize = 64 * 1024;

struct UdpShared {
    lp: EventLoop,
    fd: RawFd,
    socket: Mutex<Option<UdpSocket>>,
    closed: AtomicBool,
}

/// A bound UDP endpoint. Handles are cheap clones sharing the socket.
#[derive(Clone)]
pub struct UdpEndpoint {
    shared: Arc<UdpShared>,
}

impl UdpEndpoint {
    pub fn bind(addr: SocketAddr) -> Result<UdpEndpoint, StreamError> {
        let lp = EventLoop::current();
        let socket = UdpSocket::bind(addr)?;
        let fd = socket.as_raw_fd();
        Ok(UdpEndpoint {
            shared: Arc::new(UdpShared {
                lp,
                fd,
                socket: Mutex::new(Some(socket)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        match self.shared.socket.lock().as_ref() {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(StreamError::Closed),
        }
    }

    /// Send one datagram, parking while the socket is flow-controlled.
    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, StreamError> {
        self.check_closed()?;
        loop {
            let attempt = match self.shared.socket.lock().as_ref() {
                Some(socket) => socket.send_to(data, target),
                None => return Err(StreamError::Closed),
            };
            match attempt {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(&self.shared.lp, self.shared.fd)?;
                    self.check_closed()?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive one datagram, parking until one arrives.
    pub fn recv_from(&self) -> Result<(Bytes, SocketAddr), StreamError> {
        self.check_closed()?;
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        loop {
            let attempt = match self.shared.socket.lock().as_ref() {
                Some(socket) => socket.recv_from(&mut chunk),
                None => return Err(StreamError::Closed),
            };
            match attempt {
                Ok((n, from)) => return Ok((Bytes::copy_from_slice(&chunk[..n]), from)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_readable(&self.shared.lp, self.shared.fd)?;
                    self.check_closed()?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.lp.remove_reader(self.shared.fd);
        self.shared.lp.remove_writer(self.shared.fd);
        *self.shared.socket.lock() = None;
    }

    fn check_closed(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}
