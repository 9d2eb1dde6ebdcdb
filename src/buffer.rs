use std::env;

use bytes::{Buf, BytesMut};
use thiserror::Error as ThisError;

pub const INITIAL_CAPACITY: usize = 256;
const COMPACT_THRESHOLD: usize = 16 * 1024;
const DEFAULT_MAX_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
#[error("buffer limit of {limit} bytes exceeded")]
pub struct LimitExceeded {
    pub limit: usize,
}

/// Byte buffer with a read cursor, a saved mark and bounded growth.
///
/// Bytes are appended at the end and consumed from the read cursor. The consumed prefix is kept
/// until [`Buffer::compact`] releases it, which allows a reader to [`Buffer::mark`] a position,
/// read ahead and [`Buffer::reset`] back when it finds out there is not enough data yet.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    reader: usize,
    mark: usize,
    max_len: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_max_len(Buffer::default_max_len())
    }

    pub fn with_max_len(max_len: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(INITIAL_CAPACITY),
            reader: 0,
            mark: 0,
            max_len,
        }
    }

    /// Upper bound for unread bytes, `RUSTDIS_MAX_BUFFER_SIZE` or 512MB.
    pub fn default_max_len() -> usize {
        env::var("RUSTDIS_MAX_BUFFER_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_LEN)
    }

    pub fn write(&mut self, src: &[u8]) -> Result<(), LimitExceeded> {
        if self.readable_len() + src.len() > self.max_len {
            return Err(LimitExceeded {
                limit: self.max_len,
            });
        }
        self.data.extend_from_slice(src);
        Ok(())
    }

    /// Unread bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.reader..]
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn readable_len(&self) -> usize {
        self.data.len() - self.reader
    }

    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.reader)?;
        self.reader += 1;
        Some(byte)
    }

    /// Moves the read cursor forward, never past the written end.
    pub fn skip(&mut self, n: usize) {
        self.reader = (self.reader + n).min(self.data.len());
    }

    /// Position of the next CRLF relative to the read cursor.
    pub fn find_crlf(&self) -> Option<usize> {
        self.readable().windows(2).position(|w| w == b"\r\n")
    }

    pub fn mark(&mut self) {
        self.mark = self.reader;
    }

    pub fn reset(&mut self) {
        self.reader = self.mark;
    }

    pub fn reader_index(&self) -> usize {
        self.reader
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Releases consumed bytes once the buffer is large and mostly read.
    pub fn maybe_compact(&mut self) {
        let capacity = self.capacity();
        if capacity >= COMPACT_THRESHOLD && self.reader >= capacity / 2 {
            self.compact();
        }
    }

    pub fn compact(&mut self) {
        self.data.advance(self.reader);
        self.mark = self.mark.saturating_sub(self.reader);
        self.reader = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.reader = 0;
        self.mark = 0;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}
