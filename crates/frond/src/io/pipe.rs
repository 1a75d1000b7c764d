//! pipe
//!
//! Unix domain socket carrier: same surface as the TCP one, addressed by
//! filesystem path.

use crate::event_loop::EventLoop;
use crate::io::stream::{Connection, Listener, StreamCore, StreamServer, Transport};
use crate::io::{wait_writable, StreamError};
use bytes::Bytes;
use mio::net::{UnixListener, UnixStream};
use regex::bytes::Regex;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub struct PipeTransport {
    stream: UnixStream,
}

impl Transport for PipeTransport {
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

pub type PipeConnection = Connection<PipeTransport>;

/// Client end of a named pipe.
#[derive(Clone)]
pub struct PipeClient {
    core: StreamCore<PipeTransport>,
}

impl PipeClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<PipeClient, StreamError> {
        let lp = EventLoop::current();
        let stream = UnixStream::connect(path)?;
        let core = StreamCore::new(lp.clone(), PipeTransport { stream });
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
        Ok(PipeClient { core })
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

pub struct PipeAcceptor {
    listener: UnixListener,
}

impl Listener for PipeAcceptor {
    type Transport = PipeTransport;

    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn accept(&mut self) -> io::Result<Option<PipeTransport>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(PipeTransport { stream })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Accepting end of a named pipe.
#[derive(Clone)]
pub struct PipeServer {
    server: StreamServer<PipeAcceptor>,
    path: PathBuf,
}

impl PipeServer {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<PipeServer, StreamError> {
        let lp = EventLoop::current();
        let listener = UnixListener::bind(path.as_ref())?;
        Ok(PipeServer {
            server: StreamServer::new(lp, PipeAcceptor { listener }),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn serve<F>(&self, handle_connection: F) -> Result<(), StreamError>
    where
        F: FnMut(PipeConnection) + Send + 'static,
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
