//! Fixed-capacity byte ring over a pool buffer.
//!
//! The linear span accessors expose the contiguous run next to each pointer
//! so the connection can issue `recv`/`send` directly against the backing
//! memory; `copy_in`/`copy_out`/`peek` serve callbacks that want a flat
//! buffer. Whenever the ring drains empty both indices snap back to zero,
//! maximizing the linear space available to the next syscall.

use crate::pool::PoolBuffer;

pub struct Ring {
    buf: PoolBuffer,
    /// Read position.
    head: usize,
    /// Write position.
    tail: usize,
    /// Bytes currently stored.
    live: usize,
}

impl Ring {
    pub fn new(buf: PoolBuffer) -> Self {
        Ring {
            buf,
            head: 0,
            tail: 0,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes_readable(&self) -> usize {
        self.live
    }

    pub fn bytes_writable(&self) -> usize {
        self.capacity() - self.live
    }

    /// Contiguous free span starting at the write position.
    pub fn linear_write_span(&mut self) -> &mut [u8] {
        let writable = self.bytes_writable();
        let to_end = self.capacity() - self.tail;
        let len = writable.min(to_end);
        let tail = self.tail;
        &mut self.buf.as_mut_slice()[tail..tail + len]
    }

    /// Contiguous stored span starting at the read position.
    pub fn linear_read_span(&self) -> &[u8] {
        let readable = self.live;
        let to_end = self.capacity() - self.head;
        let len = readable.min(to_end);
        &self.buf.as_slice()[self.head..self.head + len]
    }

    /// Advance the write position after filling a linear span.
    pub fn commit_write(&mut self, len: usize) {
        debug_assert!(len <= self.bytes_writable());
        self.tail = (self.tail + len) % self.capacity();
        self.live += len;
    }

    /// Advance the read position after consuming a linear span.
    pub fn commit_read(&mut self, len: usize) {
        debug_assert!(len <= self.live);
        self.live -= len;
        if self.live == 0 {
            self.head = 0;
            self.tail = 0;
        } else {
            self.head = (self.head + len) % self.capacity();
        }
    }

    /// Copy bytes in, up to the free space. Returns bytes accepted.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.bytes_writable());
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.tail);
        let tail = self.tail;
        self.buf.as_mut_slice()[tail..tail + first].copy_from_slice(&src[..first]);
        if first < n {
            self.buf.as_mut_slice()[..n - first].copy_from_slice(&src[first..n]);
        }
        self.tail = (self.tail + n) % cap;
        self.live += n;
        n
    }

    /// Copy bytes out, advancing the read position. Returns bytes copied.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let n = self.fill(dst);
        if n > 0 {
            self.commit_read(n);
        }
        n
    }

    /// Copy bytes out without advancing the read position.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        self.fill(dst)
    }

    fn fill(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.live);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        dst[..first].copy_from_slice(&self.buf.as_slice()[self.head..self.head + first]);
        if first < n {
            dst[first..n].copy_from_slice(&self.buf.as_slice()[..n - first]);
        }
        n
    }
}
