//! stream
//!
//! The transport-independent stream machinery: a [`Transport`] supplies raw
//! nonblocking chunk I/O over an fd, [`StreamCore`] layers the bounded read
//! buffer, the pre-connect write queue, background flushing and half-close on
//! top, and [`Connection`] / [`StreamServer`] add the accept side. Concrete
//! carriers (TCP, pipes) are thin wrappers over these three.

use crate::event_loop::EventLoop;
use crate::fiber::Fiber;
use crate::io::buffer::ReadBuffer;
use crate::io::StreamError;
use crate::sync::Event;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use regex::bytes::Regex;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const READ_CHUNK_SIZE: usize = 4 * 1024;

/// The per-kind carrier of an open fd: nonblocking chunk reads and writes
/// plus write-side shutdown. Dropping it closes the fd.
pub trait Transport: Send + 'static {
    fn fd(&self) -> RawFd;
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize>;
    fn shutdown_write(&mut self) -> io::Result<()>;
}

// One parked reader at a time; the token guarantees exactly one resume even
// when readiness and a close-wake race for the same fiber.
struct ParkedReader {
    fiber: Fiber,
    token: Arc<AtomicBool>,
}

struct StreamShared<T: Transport> {
    lp: EventLoop,
    fd: RawFd,
    transport: Mutex<Option<T>>,
    read_buffer: Mutex<ReadBuffer>,
    preconnect: Mutex<Vec<Bytes>>,
    outgoing: Mutex<VecDeque<Bytes>>,
    drained: Event,
    parked_reader: Mutex<Option<ParkedReader>>,
    close_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    flushing: AtomicBool,
}

/// Byte-stream surface over a [`Transport`]: delimited/regex/length reads
/// against the buffer, writes with a back-pressure signal, half-close and
/// close. Handles are cheap clones sharing the stream.
pub struct StreamCore<T: Transport> {
    shared: Arc<StreamShared<T>>,
}

impl<T: Transport> Clone for StreamCore<T> {
    fn clone(&self) -> StreamCore<T> {
        StreamCore {
            shared: self.shared.clone(),
        }
    }
}

enum Probe<'a> {
    Bytes(usize),
    Until(&'a [u8]),
    Regex(&'a Regex),
}

impl<T: Transport> StreamCore<T> {
    pub(crate) fn new(lp: EventLoop, transport: T) -> StreamCore<T> {
        let fd = transport.fd();
        let drained = Event::new();
        drained.set();
        StreamCore {
            shared: Arc::new(StreamShared {
                lp,
                fd,
                transport: Mutex::new(Some(transport)),
                read_buffer: Mutex::new(ReadBuffer::new()),
                preconnect: Mutex::new(Vec::new()),
                outgoing: Mutex::new(VecDeque::new()),
                drained,
                parked_reader: Mutex::new(None),
                close_hook: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub(crate) fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.shared.transport.lock().as_mut().map(f)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Read exactly `nbytes`. An EOF or close while waiting yields the empty
    /// chunk instead.
    pub fn read_bytes(&self, nbytes: usize) -> Result<Bytes, StreamError> {
        assert!(nbytes > 0, "read_bytes needs a positive count");
        self.do_read(Probe::Bytes(nbytes))
    }

    /// Read through the first occurrence of `delimiter`, inclusive.
    pub fn read_until(&self, delimiter: &[u8]) -> Result<Bytes, StreamError> {
        self.do_read(Probe::Until(delimiter))
    }

    /// Read through the end of the first match of `regex`.
    pub fn read_until_regex(&self, regex: &Regex) -> Result<Bytes, StreamError> {
        self.do_read(Probe::Regex(regex))
    }

    fn do_read(&self, probe: Probe<'_>) -> Result<Bytes, StreamError> {
        if let Some(data) = self.probe_buffer(&probe) {
            return Ok(data);
        }
        self.check_closed()?;
        while !self.is_closed() {
            self.fill()?;
            if let Some(data) = self.probe_buffer(&probe) {
                return Ok(data);
            }
        }
        Ok(Bytes::new())
    }

    fn probe_buffer(&self, probe: &Probe<'_>) -> Option<Bytes> {
        let mut buffer = self.shared.read_buffer.lock();
        if buffer.is_closed() {
            return None;
        }
        match probe {
            Probe::Bytes(nbytes) => buffer.read(*nbytes),
            Probe::Until(delimiter) => buffer.read_until(delimiter),
            Probe::Regex(regex) => buffer.read_until_regex(regex),
        }
    }

    // Park until the fd is readable, then drain it into the buffer. EOF is a
    // clean close; transport errors close the stream and propagate.
    fn fill(&self) -> Result<(), StreamError> {
        let lp = self.shared.lp.clone();
        let fd = self.shared.fd;
        let token = Arc::new(AtomicBool::new(false));
        let resume = Fiber::current();
        *self.shared.parked_reader.lock() = Some(ParkedReader {
            fiber: resume.clone(),
            token: token.clone(),
        });
        let gate = token.clone();
        let registered = lp.add_reader(fd, move || {
            if !gate.swap(true, Ordering::SeqCst) {
                let _ = resume.switch();
            }
        });
        if let Err(e) = registered {
            *self.shared.parked_reader.lock() = None;
            return Err(e.into());
        }
        let parked = lp.switch();
        lp.remove_reader(fd);
        *self.shared.parked_reader.lock() = None;
        parked?;
        if self.is_closed() {
            return Ok(());
        }

        let mut transport = self.shared.transport.lock();
        let carrier = match transport.as_mut() {
            Some(carrier) => carrier,
            None => return Ok(()),
        };
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut fed_any = false;
        loop {
            match carrier.read_chunk(&mut chunk) {
                Ok(0) => {
                    // EOF after data in the same pass: stop here so the
                    // caller probes what was fed; the close happens on the
                    // next fill, which sees the EOF first.
                    if fed_any {
                        break;
                    }
                    drop(transport);
                    self.close();
                    return Ok(());
                }
                Ok(n) => {
                    let fed = self
                        .shared
                        .read_buffer
                        .lock()
                        .feed(Bytes::copy_from_slice(&chunk[..n]));
                    if let Err(full) = fed {
                        drop(transport);
                        self.close();
                        return Err(full.into());
                    }
                    fed_any = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(transport);
                    self.close();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Queue `data` for delivery. Returns the back-pressure signal: `true`
    /// when the outgoing queue is drained, `false` when bytes remain queued
    /// (including every write before the stream is connected).
    pub fn write(&self, data: &[u8]) -> Result<bool, StreamError> {
        self.check_closed()?;
        if !self.is_connected() {
            self.shared
                .preconnect
                .lock()
                .push(Bytes::copy_from_slice(data));
            return Ok(false);
        }
        self.write_out(Bytes::copy_from_slice(data))
    }

    fn write_out(&self, data: Bytes) -> Result<bool, StreamError> {
        {
            let mut outgoing = self.shared.outgoing.lock();
            if !outgoing.is_empty() {
                // A flush is already pending; keep ordering and report
                // backed-up.
                outgoing.push_back(data);
                return Ok(false);
            }
        }
        let mut data = data;
        {
            let mut transport = self.shared.transport.lock();
            let carrier = match transport.as_mut() {
                Some(carrier) => carrier,
                None => return Err(StreamError::Closed),
            };
            while !data.is_empty() {
                match carrier.write_chunk(&data) {
                    Ok(n) => data.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        drop(transport);
                        self.close();
                        return Err(e.into());
                    }
                }
            }
        }
        if data.is_empty() {
            return Ok(true);
        }
        self.shared.drained.clear();
        self.shared.outgoing.lock().push_back(data);
        self.arm_flush()?;
        Ok(false)
    }

    // Background flush: a writer registration that pushes queued bytes out
    // on the loop thread until the queue drains, then disarms itself.
    fn arm_flush(&self) -> Result<(), StreamError> {
        if self.shared.flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = self.shared.clone();
        let registered = self.shared.lp.add_writer(self.shared.fd, move || {
            StreamShared::flush_ready(&shared);
        });
        match registered {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.flushing.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Half-close: wait for queued writes to drain, then shut the write side.
    pub fn shutdown(&self) -> Result<(), StreamError> {
        self.check_closed()?;
        while !self.shared.outgoing.lock().is_empty() {
            self.shared.drained.wait(None)?;
            self.check_closed()?;
        }
        match self.with_transport(|t| t.shutdown_write()) {
            Some(result) => result.map_err(StreamError::Io),
            None => Err(StreamError::Closed),
        }
    }

    /// Idempotent teardown: cancels registrations, clears both buffers,
    /// wakes a parked reader, drops the transport (closing the fd).
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let lp = &self.shared.lp;
        lp.remove_reader(self.shared.fd);
        lp.remove_writer(self.shared.fd);
        self.shared.read_buffer.lock().close();
        self.shared.preconnect.lock().clear();
        self.shared.outgoing.lock().clear();
        self.shared.drained.set();
        if let Some(parked) = self.shared.parked_reader.lock().take() {
            if !parked.token.swap(true, Ordering::SeqCst) {
                let fiber = parked.fiber;
                lp.call_soon(move || {
                    let _ = fiber.switch();
                });
            }
        }
        *self.shared.transport.lock() = None;
        // Fires on every close path, EOF and error included.
        if let Some(hook) = self.shared.close_hook.lock().take() {
            hook();
        }
    }

    pub(crate) fn set_close_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.shared.close_hook.lock() = Some(hook);
    }

    /// Flip to connected and flush everything written so far in one go.
    pub(crate) fn set_connected(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
        let buffered: Vec<Bytes> = std::mem::take(&mut *self.shared.preconnect.lock());
        if !buffered.is_empty() {
            let mut joined = bytes::BytesMut::new();
            for chunk in buffered {
                joined.extend_from_slice(&chunk);
            }
            if let Err(e) = self.write_out(joined.freeze()) {
                debug!("flush of pre-connect writes failed => {e}");
            }
        }
    }

    fn check_closed(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<T: Transport> StreamShared<T> {
    // Runs as the writer handler on the loop thread.
    fn flush_ready(shared: &Arc<StreamShared<T>>) {
        let mut failed: Option<io::Error> = None;
        let done: bool;
        {
            let mut transport = shared.transport.lock();
            let carrier = match transport.as_mut() {
                Some(carrier) => carrier,
                None => return,
            };
            let mut outgoing = shared.outgoing.lock();
            'queue: while let Some(front) = outgoing.front_mut() {
                while !front.is_empty() {
                    match carrier.write_chunk(front) {
                        Ok(n) => front.advance(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 'queue,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            failed = Some(e);
                            break 'queue;
                        }
                    }
                }
                outgoing.pop_front();
            }
            done = outgoing.is_empty();
        }
        let core = StreamCore {
            shared: shared.clone(),
        };
        if let Some(e) = failed {
            debug!("write failed => {e}");
            core.close();
            return;
        }
        if done {
            shared.lp.remove_writer(shared.fd);
            shared.flushing.store(false, Ordering::SeqCst);
            shared.drained.set();
        }
    }
}

/// A server-side stream that unregisters itself from its server when closed,
/// whether by `close`, peer EOF, or a transport error.
pub struct Connection<T: Transport> {
    core: StreamCore<T>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Connection<T> {
        Connection {
            core: self.core.clone(),
        }
    }
}

impl<T: Transport> Connection<T> {
    pub(crate) fn accepted(lp: EventLoop, transport: T) -> Connection<T> {
        let core = StreamCore::new(lp, transport);
        core.set_connected();
        Connection { core }
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

    pub(crate) fn core(&self) -> &StreamCore<T> {
        &self.core
    }
}

/// What a server listens on: an fd plus a nonblocking accept producing
/// transports (`None` when the backlog is drained).
pub trait Listener: Send + 'static {
    type Transport: Transport;
    fn fd(&self) -> RawFd;
    fn accept(&mut self) -> io::Result<Option<Self::Transport>>;
}

struct ServerShared<L: Listener> {
    lp: EventLoop,
    listener: Mutex<Option<L>>,
    fd: RawFd,
    end_event: Event,
    closed: AtomicBool,
    connections: Mutex<Vec<Connection<L::Transport>>>,
}

/// Accept loop over a [`Listener`]: each accepted transport is wrapped in a
/// [`Connection`], tracked, and handed to the connection callback (which
/// typically spawns a task). `serve` parks until `close`.
pub struct StreamServer<L: Listener> {
    shared: Arc<ServerShared<L>>,
}

impl<L: Listener> Clone for StreamServer<L> {
    fn clone(&self) -> StreamServer<L> {
        StreamServer {
            shared: self.shared.clone(),
        }
    }
}

impl<L: Listener> StreamServer<L> {
    pub(crate) fn new(lp: EventLoop, listener: L) -> StreamServer<L> {
        let fd = listener.fd();
        StreamServer {
            shared: Arc::new(ServerShared {
                lp,
                listener: Mutex::new(Some(listener)),
                fd,
                end_event: Event::new(),
                closed: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Accept connections, dispatching each to `handle_connection`, until
    /// the server is closed.
    pub fn serve<F>(&self, mut handle_connection: F) -> Result<(), StreamError>
    where
        F: FnMut(Connection<L::Transport>) + Send + 'static,
    {
        if self.is_closed() {
            return Err(StreamError::ServerClosed);
        }
        let shared = self.shared.clone();
        self.shared.lp.add_reader(self.shared.fd, move || {
            ServerShared::accept_ready(&shared, &mut handle_connection);
        })?;
        self.shared.end_event.wait(None)?;
        Ok(())
    }

    /// Close the listener and every live connection; releases `serve`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.lp.remove_reader(self.shared.fd);
        *self.shared.listener.lock() = None;
        let connections: Vec<Connection<L::Transport>> =
            std::mem::take(&mut *self.shared.connections.lock());
        for connection in connections {
            connection.close();
        }
        self.shared.end_event.set();
    }
}

impl<L: Listener> ServerShared<L> {
    // Runs as the listener's reader handler: drain the accept backlog.
    fn accept_ready<F>(shared: &Arc<ServerShared<L>>, handle_connection: &mut F)
    where
        F: FnMut(Connection<L::Transport>),
    {
        loop {
            let accepted = {
                let mut listener = shared.listener.lock();
                match listener.as_mut() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok(Some(transport)) => {
                    let connection = Connection::accepted(shared.lp.clone(), transport);
                    let registry = Arc::downgrade(shared);
                    let fd = connection.core().fd();
                    connection.core().set_close_hook(Box::new(move || {
                        if let Some(shared) = registry.upgrade() {
                            shared
                                .connections
                                .lock()
                                .retain(|c| c.core().fd() != fd);
                        }
                    }));
                    shared.connections.lock().push(connection.clone());
                    handle_connection(connection);
                }
                Ok(None) => return,
                Err(e) => {
                    debug!("accept failed => {e}");
                    return;
                }
            }
        }
    }
}
