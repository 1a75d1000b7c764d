//! tcp
//!
//! TCP carrier for the stream core: a client with nonblocking connect, the
//! server-side connection, and the accepting server.

use crate::event_loop::EventLoop;
use crate::io::stream::{Connection, Listener, StreamCore, StreamServer, Transport};
use crate::io::{wait_writable, StreamError};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use regex::bytes::Regex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }
}

pub type TcpConnection = Connection<TcpTransport>;

/// Client-side TCP stream.
#[derive(Clone)]
pub struct TcpClient {
    core: StreamCore<TcpTransport>,
}

impl TcpClient {
    /// Open a nonblocking connection to `addr` and wait until it is
    /// established. Connection failure surfaces the socket error.
    pub fn connect(addr: SocketAddr) -> Result<TcpClient, StreamError> {
        let lp = EventLoop::current();
        let stream = TcpStream::connect(addr)?;
        let core = StreamCore::new(lp.clone(), TcpTransport { stream });
        // The connect protocol of a nonblocking socket: wait for
        // writability, then read the socket error slot to learn the outcome.
        if let Err(e) = wait_writable(&lp, core.fd()) {
            core.close();
            return Err(e);
        }
        let outcome = core
            .with_transport(|t| t.stream.take_error())
            .unwrap_or_else(|| Ok(None));
        match outcome {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                core.close();
                return Err(e.into());
            }
        }
        core.set_connected();
        Ok(TcpClient { core })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        match self.core.with_transport(|t| t.stream.local_addr()) {
            Some(addr) => Ok(addr?),
            None => Err(StreamError::Closed),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, StreamError> {
        match self.core.with_transport(|t| t.stream.peer_addr()) {
            Some(addr) => Ok(addr?),
            None => Err(StreamError::Closed),
        }
    }

    pub fn read_bytes(&self, nbytes: usize) -> Result<Bytes, StreamError> {
        self.core.read_bytes(nbytes)
    }

    pub fn read_until(&self, delimiter: &[u8]) -> Result<Bytes, StreamError> {
        self.core.read_until(delimiter)
    }

    pub fn read_until_regex(&self, regex: &Regex) -> Result<Bytes, StreamError> {
        self.core.read_until_regex(regex)
    }

    pub fn write(&self, data: &[u8]) -> Result<bool, StreamError> {
        self.core.write(data)
    }

    pub fn shutdown(&self) -> Result<(), StreamError> {
        self.core.shutdown()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn close(&self) {
        self.core.close()
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl Listener for TcpAcceptor {
    type Transport = TcpTransport;

    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn accept(&mut self) -> io::Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(TcpTransport { stream })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Accepting TCP server. Bind, then `serve` with a connection callback.
#[derive(Clone)]
pub struct TcpServer {
    server: StreamServer<TcpAcceptor>,
    addr: SocketAddr,
}

impl TcpServer {
    pub fn bind(addr: SocketAddr) -> Result<TcpServer, StreamError> {
        let lp = EventLoop::current();
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        Ok(TcpServer {
            server: StreamServer::new(lp, TcpAcceptor { listener }),
            addr,
        })
    }

    /// The actually bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until closed, handing each to the callback.
    pub fn serve<F>(&self, handle_connection: F) -> Result<(), StreamError>
    where
        F: FnMut(TcpConnection) + Send + 'static,
    {
        self.server.serve(handle_connection)
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn is_closed(&self) -> bool {
        self.server.is_closed()
    }

    pub fn close(&self) {
        self.server.close()
    }
}
