//! Per-connection receive buffer.
//!
//! A bounded streaming buffer with two cursors over the bytes received so
//! far:
//!
//! ```text
//!  0        commit      read             end          capacity
//!  |--------|-----------|----------------|------------|
//!   consumed  speculative  unread           free
//! ```
//!
//! The parser reads speculatively from `read`, and only moves `commit` once a
//! whole record has been validated and acted upon. If a record turns out to
//! be incomplete, `reset_read` rewinds to `commit` and parsing is retried
//! after the next `refill`.
//!
//! Views returned by [`ReceiveBuffer::read`] borrow the buffer, so the borrow
//! checker rules out holding one across [`ReceiveBuffer::consume`] or
//! [`ReceiveBuffer::refill`].

use crate::protocol::Decode;
use std::io::{self, Read};

/// Outcome of a single [`ReceiveBuffer::refill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes were appended.
    Data(usize),
    /// The source has nothing more right now.
    WouldBlock,
    /// The peer closed its side.
    Eof,
    /// No free space, even after dropping the committed prefix.
    Full,
}

/// Bounded receive buffer with read and commit cursors.
pub struct ReceiveBuffer {
    buf: Box<[u8]>,
    commit: usize,
    read: usize,
    end: usize,
}

impl ReceiveBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            commit: 0,
            read: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Perform one read from `src` into the free tail of the buffer.
    ///
    /// The committed prefix is dropped first if the tail is exhausted.
    pub fn refill<R: Read>(&mut self, mut src: R) -> io::Result<Fill> {
        if self.end == self.buf.len() {
            self.consume();
        }
        if self.end == self.buf.len() {
            return Ok(Fill::Full);
        }

        loop {
            match src.read(&mut self.buf[self.end..]) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.end += n;
                    return Ok(Fill::Data(n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Rewind the read cursor to the last commit point.
    pub fn reset_read(&mut self) {
        self.read = self.commit;
    }

    /// Mark everything read so far as consumed.
    pub fn commit(&mut self) {
        self.commit = self.read;
    }

    /// Bytes between the read cursor and the end of valid data.
    pub fn read_max_len(&self) -> usize {
        self.end - self.read
    }

    /// Read exactly `n` bytes, or nothing if fewer are available.
    pub fn read(&mut self, n: usize) -> Option<&[u8]> {
        if self.read_max_len() < n {
            return None;
        }
        let start = self.read;
        self.read += n;
        Some(&self.buf[start..self.read])
    }

    /// Decode the next `T::LEN` bytes as a `T`, or nothing if fewer are available.
    pub fn read_obj<T: Decode>(&mut self) -> Option<T> {
        self.read(T::LEN).map(T::decode)
    }

    /// Skip exactly `n` bytes. Returns `false` (skipping nothing) if fewer are available.
    pub fn discard(&mut self, n: usize) -> bool {
        if self.read_max_len() < n {
            return false;
        }
        self.read += n;
        true
    }

    /// Drop everything before the commit cursor and compact the rest to the front.
    pub fn consume(&mut self) {
        if self.commit == 0 {
            return;
        }
        self.buf.copy_within(self.commit..self.end, 0);
        self.end -= self.commit;
        self.read -= self.commit;
        self.commit = 0;
    }

    /// Bytes held past the commit cursor.
    pub fn pending(&self) -> usize {
        self.end - self.commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Header, RecordType};

    /// Reader that hands out scripted chunks, then reports would-block.
    struct Chunks(Vec<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk = &mut self.0[0];
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.0.remove(0);
            }
            Ok(n)
        }
    }

    #[test]
    fn test_refill_outcomes() {
        let mut buf = ReceiveBuffer::new(16);
        let mut src = Chunks(vec![b"hello".to_vec()]);

        assert_eq!(buf.refill(&mut src).unwrap(), Fill::Data(5));
        assert_eq!(buf.refill(&mut src).unwrap(), Fill::WouldBlock);
        assert_eq!(buf.refill(&b""[..]).unwrap(), Fill::Eof);
        assert_eq!(buf.read_max_len(), 5);
    }

    #[test]
    fn test_read_is_all_or_nothing() {
        let mut buf = ReceiveBuffer::new(16);
        buf.refill(&b"abcdef"[..]).unwrap();

        assert_eq!(buf.read(4), Some(&b"abcd"[..]));
        assert_eq!(buf.read(3), None);
        assert_eq!(buf.read_max_len(), 2);
        assert!(!buf.discard(3));
        assert!(buf.discard(2));
        assert_eq!(buf.read_max_len(), 0);
    }

    #[test]
    fn test_reset_read_rewinds_to_commit() {
        let mut buf = ReceiveBuffer::new(16);
        buf.refill(&b"abcdef"[..]).unwrap();

        buf.read(2).unwrap();
        buf.commit();
        buf.read(3).unwrap();
        buf.reset_read();

        assert_eq!(buf.read_max_len(), 4);
        assert_eq!(buf.read(4), Some(&b"cdef"[..]));
    }

    #[test]
    fn test_read_obj_decodes_header() {
        let mut buf = ReceiveBuffer::new(32);
        let header = Header::new(RecordType::Params, 9, 300);
        buf.refill(&header.encode()[..5]).unwrap();

        // partial header yields nothing and consumes nothing
        assert!(buf.read_obj::<Header>().is_none());
        assert_eq!(buf.read_max_len(), 5);

        buf.refill(&header.encode()[5..]).unwrap();
        let decoded = buf.read_obj::<Header>().unwrap();
        assert_eq!(decoded.request_id(), 9);
        assert_eq!(decoded.content_length(), 300);
    }

    #[test]
    fn test_consume_compacts_committed_prefix() {
        let mut buf = ReceiveBuffer::new(8);
        buf.refill(&b"abcdefgh"[..]).unwrap();
        assert_eq!(buf.pending(), 8);

        buf.read(6).unwrap();
        buf.commit();
        buf.consume();
        assert_eq!(buf.pending(), 2);
        assert_eq!(buf.read_max_len(), 2);

        // freed space is reusable
        assert_eq!(buf.refill(&b"ijklmnop"[..]).unwrap(), Fill::Data(6));
        assert_eq!(buf.read(8), Some(&b"ghijklmn"[..]));
    }

    #[test]
    fn test_refill_compacts_when_tail_exhausted() {
        let mut buf = ReceiveBuffer::new(4);
        buf.refill(&b"abcd"[..]).unwrap();
        buf.read(3).unwrap();
        buf.commit();

        assert_eq!(buf.refill(&b"xyz"[..]).unwrap(), Fill::Data(3));
        assert_eq!(buf.read(4), Some(&b"dxyz"[..]));
    }

    #[test]
    fn test_refill_full_without_commit() {
        let mut buf = ReceiveBuffer::new(4);
        buf.refill(&b"abcd"[..]).unwrap();
        buf.read(2).unwrap();

        // nothing committed, nothing can be dropped
        assert_eq!(buf.refill(&b"more"[..]).unwrap(), Fill::Full);
    }
}
