//! Thread-safe bounded byte buffer with backpressure.
//!
//! One writer thread fills the buffer while one reader drains it. Writers
//! block while the buffer is full, readers block while it is empty; closing
//! the buffer releases everyone. Two condition variables (`used`, `free`)
//! signal the two directions independently.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("Read timeout")]
pub struct ReadTimeout;

struct Inner {
    buf: Vec<u8>,
    size: usize,
    read_offset: usize,
    write_offset: usize,
    length: usize,
    closed: bool,
}

impl Inner {
    /// Copy `chunk` into the ring at the write offset. Caller guarantees
    /// `chunk.len() <= size - length`.
    fn push(&mut self, chunk: &[u8]) {
        let n = chunk.len();
        let tail = self.size - self.write_offset;
        if n <= tail {
            self.buf[self.write_offset..self.write_offset + n].copy_from_slice(chunk);
        } else {
            self.buf[self.write_offset..].copy_from_slice(&chunk[..tail]);
            self.buf[..n - tail].copy_from_slice(&chunk[tail..]);
        }
        self.write_offset = (self.write_offset + n) % self.size;
        self.length += n;
    }

    /// Pop up to `n` bytes from the read offset.
    fn pop(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.length);
        let mut out = vec![0u8; n];
        let tail = self.size - self.read_offset;
        if n <= tail {
            out.copy_from_slice(&self.buf[self.read_offset..self.read_offset + n]);
        } else {
            out[..tail].copy_from_slice(&self.buf[self.read_offset..]);
            out[tail..].copy_from_slice(&self.buf[..n - tail]);
        }
        self.read_offset = (self.read_offset + n) % self.size;
        self.length -= n;
        out
    }
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
    used: Condvar,
    free: Condvar,
}

impl RingBuffer {
    /// A buffer of `size` bytes. Zero is clamped to one byte so the ring
    /// arithmetic never divides by the capacity of an empty buffer.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; size],
                size,
                read_offset: 0,
                write_offset: 0,
                length: 0,
                closed: false,
            }),
            used: Condvar::new(),
            free: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be written before the buffer is full.
    pub fn free(&self) -> usize {
        let inner = self.lock();
        inner.size - inner.length
    }

    pub fn capacity(&self) -> usize {
        self.lock().size
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Read up to `n` bytes.
    ///
    /// Blocks while the buffer is empty when `block` is set, up to `timeout`
    /// when one is given. Returns an empty vec once the buffer is closed and
    /// drained, or immediately when `block` is unset.
    pub fn read(
        &self,
        n: usize,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ReadTimeout> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if inner.length > 0 {
                let out = inner.pop(n);
                self.free.notify_all();
                return Ok(out);
            }
            if inner.closed || !block {
                return Ok(Vec::new());
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ReadTimeout);
                    }
                    let (guard, _) = self
                        .used
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard
                }
                None => self.used.wait(inner).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    /// Write all of `data`, blocking while the buffer is full.
    ///
    /// The write may complete in several slices as the reader frees space.
    /// Returns the number of bytes actually written, which is less than
    /// `data.len()` only if the buffer was closed mid-write. Data is never
    /// discarded silently.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut written = 0;
        let mut inner = self.lock();
        while written < data.len() {
            if inner.closed {
                break;
            }
            let avail = inner.size - inner.length;
            if avail == 0 {
                inner = self.free.wait(inner).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            let n = avail.min(data.len() - written);
            inner.push(&data[written..written + n]);
            written += n;
            self.used.notify_all();
        }
        written
    }

    /// Block until at least one byte can be written, the timeout lapses or
    /// the buffer closes.
    pub fn wait_free(&self, timeout: Duration) {
        let inner = self.lock();
        if inner.length < inner.size || inner.closed {
            return;
        }
        let _ = self
            .free
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Block until at least one byte can be read, the timeout lapses or the
    /// buffer closes.
    pub fn wait_used(&self, timeout: Duration) {
        let inner = self.lock();
        if inner.length > 0 || inner.closed {
            return;
        }
        let _ = self
            .used
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Atomically grow or shrink the buffer, preserving buffered bytes in
    /// read order. Shrinking below the current length keeps the newest
    /// capacity's worth unavailable for writers until drained.
    pub fn resize(&self, new_size: usize) {
        let new_size = new_size.max(1);
        let mut inner = self.lock();
        let buffered = inner.length;
        let pending = inner.pop(buffered);
        inner.buf = vec![0u8; new_size];
        inner.size = new_size;
        inner.read_offset = 0;
        inner.write_offset = 0;
        inner.length = 0;
        // Re-insert what fits; a well-behaved caller resizes only upward
        // while a stream is active.
        let keep = pending.len().min(new_size);
        let chunk = &pending[..keep];
        inner.push(chunk);
        self.free.notify_all();
    }

    /// Close the buffer, releasing all blocked readers and writers.
    /// Idempotent and callable from any thread.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.used.notify_all();
        self.free.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn read_returns_written_bytes_in_order() {
        let buf = RingBuffer::new(32);
        assert_eq!(buf.write(b"hello"), 5);
        assert_eq!(buf.write(b" world"), 6);
        assert_eq!(buf.read(5, false, None).unwrap(), b"hello");
        assert_eq!(buf.read(64, false, None).unwrap(), b" world");
        assert!(buf.read(1, false, None).unwrap().is_empty());
    }

    #[test]
    fn wraparound_preserves_order() {
        let buf = RingBuffer::new(8);
        buf.write(b"abcdef");
        assert_eq!(buf.read(4, false, None).unwrap(), b"abcd");
        buf.write(b"ghijkl");
        assert_eq!(buf.read(8, false, None).unwrap(), b"efghijkl");
    }

    #[test]
    fn writer_blocks_until_reader_frees_space() {
        let buf = Arc::new(RingBuffer::new(4));
        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.write(b"abcdefgh"))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.len(), 4);
        let mut out = Vec::new();
        while out.len() < 8 {
            out.extend(buf.read(8, true, Some(Duration::from_secs(1))).unwrap());
        }
        assert_eq!(writer.join().unwrap(), 8);
        assert_eq!(out, b"abcdefgh");
    }

    #[test]
    fn close_releases_blocked_reader_with_empty_result() {
        let buf = Arc::new(RingBuffer::new(4));
        let reader = {
            let buf = buf.clone();
            thread::spawn(move || buf.read(1, true, None).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        buf.close();
        assert!(reader.join().unwrap().is_empty());
    }

    #[test]
    fn close_interrupts_blocked_writer() {
        let buf = Arc::new(RingBuffer::new(2));
        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.write(b"abcdef"))
        };
        thread::sleep(Duration::from_millis(50));
        buf.close();
        assert_eq!(writer.join().unwrap(), 2);
        // Buffered bytes remain readable after close.
        assert_eq!(buf.read(8, true, None).unwrap(), b"ab");
        assert!(buf.read(8, true, None).unwrap().is_empty());
    }

    #[test]
    fn blocking_read_times_out() {
        let buf = RingBuffer::new(4);
        let err = buf.read(1, true, Some(Duration::from_millis(20)));
        assert!(err.is_err());
    }

    #[test]
    fn zero_size_is_clamped_to_one_byte() {
        let buf = RingBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.write(b"x"), 1);
        assert_eq!(buf.read(1, false, None).unwrap(), b"x");
        buf.resize(0);
        assert_eq!(buf.capacity(), 1);
    }

    #[test]
    fn resize_keeps_pending_bytes() {
        let buf = RingBuffer::new(4);
        buf.write(b"abcd");
        buf.resize(16);
        assert_eq!(buf.capacity(), 16);
        buf.write(b"efgh");
        assert_eq!(buf.read(16, false, None).unwrap(), b"abcdefgh");
    }
}
