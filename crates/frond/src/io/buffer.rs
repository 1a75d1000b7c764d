//! buffer
//!
//! Bounded deque-of-chunks read buffer with delimiter and regex probes.
//! Multi-byte delimiters may straddle chunks, so probes scan the head chunk
//! and merge gradually: if the scan fails and more chunks exist, the first
//! two are coalesced and the scan retried. Line-oriented protocols find
//! their delimiter within the first few chunks, so large merges stay rare
//! and get undone by consumption anyway.

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use std::collections::VecDeque;
use thiserror::Error;

pub const MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("maximum buffer size reached")]
pub struct BufferFull;

pub struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
    max_size: usize,
    closed: bool,
}

impl ReadBuffer {
    pub fn new() -> ReadBuffer {
        ReadBuffer::with_max_size(MAX_BUFFER_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> ReadBuffer {
        ReadBuffer {
            chunks: VecDeque::new(),
            size: 0,
            max_size,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append a chunk. Exceeding the size bound closes the buffer and
    /// reports the overflow.
    pub fn feed(&mut self, chunk: Bytes) -> Result<(), BufferFull> {
        self.check_closed();
        self.size += chunk.len();
        self.chunks.push_back(chunk);
        if self.size >= self.max_size {
            self.close();
            return Err(BufferFull);
        }
        Ok(())
    }

    /// All-or-nothing read of exactly `nbytes`.
    pub fn read(&mut self, nbytes: usize) -> Option<Bytes> {
        self.check_closed();
        if self.size >= nbytes {
            Some(self.consume(nbytes))
        } else {
            None
        }
    }

    /// Everything through the first occurrence of `delimiter`, inclusive.
    pub fn read_until(&mut self, delimiter: &[u8]) -> Option<Bytes> {
        self.check_closed();
        if self.chunks.is_empty() || delimiter.is_empty() {
            return None;
        }
        loop {
            if let Some(loc) = find(&self.chunks[0], delimiter) {
                return Some(self.consume(loc + delimiter.len()));
            }
            if self.chunks.len() == 1 {
                return None;
            }
            self.double_prefix();
        }
    }

    /// Everything through the end of the first match of `regex`.
    pub fn read_until_regex(&mut self, regex: &Regex) -> Option<Bytes> {
        self.check_closed();
        if self.chunks.is_empty() {
            return None;
        }
        loop {
            if let Some(found) = regex.find(&self.chunks[0]) {
                return Some(self.consume(found.end()));
            }
            if self.chunks.len() == 1 {
                return None;
            }
            self.double_prefix();
        }
    }

    pub fn clear(&mut self) {
        self.check_closed();
        self.chunks.clear();
        self.size = 0;
    }

    /// Idempotent; every later operation is a programming error.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.chunks.clear();
            self.size = 0;
        }
    }

    fn check_closed(&self) {
        assert!(!self.closed, "I/O operation on closed buffer");
    }

    fn consume(&mut self, loc: usize) -> Bytes {
        if loc == 0 {
            return Bytes::new();
        }
        self.merge_prefix(loc);
        self.size -= loc;
        self.chunks.pop_front().unwrap_or_default()
    }

    // Grow the head chunk by doubling, but don't split the second chunk just
    // because the first one is small.
    fn double_prefix(&mut self) {
        let target = (self.chunks[0].len() * 2).max(self.chunks[0].len() + self.chunks[1].len());
        self.merge_prefix(target);
    }

    // Replace the leading chunks with a single chunk of up to `size` bytes,
    // splitting a chunk when it straddles the boundary.
    fn merge_prefix(&mut self, size: usize) {
        if self.chunks.len() == 1 && self.chunks[0].len() <= size {
            return;
        }
        let mut prefix = BytesMut::with_capacity(size.min(self.size));
        let mut remaining = size;
        while remaining > 0 {
            let mut chunk = match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };
            if chunk.len() > remaining {
                self.chunks.push_front(chunk.split_off(remaining));
            }
            remaining -= chunk.len();
            prefix.extend_from_slice(&chunk);
        }
        self.chunks.push_front(prefix.freeze());
    }
}

impl Default for ReadBuffer {
    fn default() -> ReadBuffer {
        ReadBuffer::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_then_read_round_trip() {
        let mut buffer = ReadBuffer::new();
        buffer.feed(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(buffer.read(5).unwrap(), Bytes::from_static(b"hello"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_is_all_or_nothing() {
        let mut buffer = ReadBuffer::new();
        buffer.feed(Bytes::from_static(b"abc")).unwrap();
        assert!(buffer.read(4).is_none());
        assert_eq!(buffer.read(2).unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_read_until_delimiter_straddles_chunks() {
        let mut buffer = ReadBuffer::new();
        buffer.feed(Bytes::from_static(b"hel")).unwrap();
        buffer.feed(Bytes::from_static(b"lo\nworld\n")).unwrap();
        assert_eq!(buffer.read_until(b"\n").unwrap(), Bytes::from_static(b"hello\n"));
        assert_eq!(buffer.read_until(b"\n").unwrap(), Bytes::from_static(b"world\n"));
        assert!(buffer.read_until(b"\n").is_none());
    }

    #[test]
    fn test_read_until_multibyte_delimiter() {
        let mut buffer = ReadBuffer::new();
        buffer.feed(Bytes::from_static(b"a\r")).unwrap();
        buffer.feed(Bytes::from_static(b"\nb")).unwrap();
        assert_eq!(buffer.read_until(b"\r\n").unwrap(), Bytes::from_static(b"a\r\n"));
        assert_eq!(buffer.read(1).unwrap(), Bytes::from_static(b"b"));
    }

    #[test]
    fn test_read_until_regex() {
        let mut buffer = ReadBuffer::new();
        let regex = Regex::new(r"\d+;").unwrap();
        buffer.feed(Bytes::from_static(b"abc12")).unwrap();
        buffer.feed(Bytes::from_static(b"3;rest")).unwrap();
        assert_eq!(
            buffer.read_until_regex(&regex).unwrap(),
            Bytes::from_static(b"abc123;")
        );
        assert_eq!(buffer.read(4).unwrap(), Bytes::from_static(b"rest"));
    }

    #[test]
    fn test_feed_overflow_closes() {
        let mut buffer = ReadBuffer::with_max_size(4);
        assert!(buffer.feed(Bytes::from_static(b"abcd")).is_err());
        assert!(buffer.is_closed());
    }

    #[test]
    #[should_panic(expected = "closed buffer")]
    fn test_read_after_close_panics() {
        let mut buffer = ReadBuffer::new();
        buffer.close();
        buffer.read(1);
    }

    #[test]
    fn test_size_tracks_chunks() {
        let mut buffer = ReadBuffer::new();
        buffer.feed(Bytes::from_static(b"ab")).unwrap();
        buffer.feed(Bytes::from_static(b"cde")).unwrap();
        assert_eq!(buffer.len(), 5);
        buffer.read_until(b"d").unwrap();
        assert_eq!(buffer.len(), 1);
    }
}
