//! Per-connection I/O engine.
//!
//! A [`Conn`] owns the socket, a read/write ring pair backed by pool
//! buffers, and the cached readiness interest used by `renable_events`.
//! One-shot readiness guarantees at most one worker task references a
//! connection at a time, so the ring mutex is never contended; it exists to
//! make the cross-thread handoff between an I/O loop and a worker sound.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use socket2::Socket;

use crate::config::Interest;
use crate::io_loop::IoLoopShared;
use crate::pool::PoolBuffer;
use crate::ring::Ring;

/// Result of `write` on a hung-up peer (`EPIPE`/`ECONNRESET`).
pub const WRITE_PEER_CLOSED: isize = -2;
/// Result of `write` on any other socket error.
pub const WRITE_ERR: isize = -1;

pub(crate) struct RingPair {
    pub read: Ring,
    pub write: Ring,
}

/// Thread-safe list of connections awaiting teardown on the acceptor thread.
pub(crate) struct CloseList<C> {
    pending: Mutex<Vec<Arc<Conn<C>>>>,
}

impl<C> CloseList<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(CloseList {
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, conn: Arc<Conn<C>>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    /// Take the whole backlog out under the lock; callbacks run outside it.
    pub fn take_batch(&self) -> Vec<Arc<Conn<C>>> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Connection controller handed to application callbacks.
pub struct Conn<C> {
    sock: Socket,
    peer: SocketAddr,
    peer_label: String,
    loop_idx: usize,
    io: Arc<IoLoopShared>,
    close_list: Arc<CloseList<C>>,
    rings: Mutex<RingPair>,
    ctx: Mutex<Option<C>>,
    /// Last-requested interest bits; cleared when a rearm fails.
    events: AtomicU8,
    peer_closed: AtomicBool,
    closed: AtomicBool,
    weak: Weak<Conn<C>>,
}

impl<C> Conn<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sock: Socket,
        peer: SocketAddr,
        ctx: C,
        loop_idx: usize,
        io: Arc<IoLoopShared>,
        close_list: Arc<CloseList<C>>,
        read_buf: PoolBuffer,
        write_buf: PoolBuffer,
        initial: Interest,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Conn {
            sock,
            peer,
            peer_label: format!("[{}]:{}", peer.ip(), peer.port()),
            loop_idx,
            io,
            close_list,
            rings: Mutex::new(RingPair {
                read: Ring::new(read_buf),
                write: Ring::new(write_buf),
            }),
            ctx: Mutex::new(Some(ctx)),
            events: AtomicU8::new(initial.bits()),
            peer_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Peer address as seen at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Printable `"[ip]:port"` identifier used in log lines.
    pub fn peer_label(&self) -> &str {
        &self.peer_label
    }

    /// Latched true once `EPOLLRDHUP` fires or a write hits a reset peer.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }

    /// Copy bytes out of the read ring. Returns 0 when the ring is empty.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.rings().read.copy_out(buf)
    }

    /// Copy bytes out of the read ring without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.rings().read.peek(buf)
    }

    /// Send directly on the socket.
    ///
    /// Returns the bytes accepted by one `send` call (possibly short), 0 if
    /// the socket would block, [`WRITE_ERR`] on a system error, or
    /// [`WRITE_PEER_CLOSED`] — latching the peer-closed flag — when the peer
    /// has hung up.
    pub fn write(&self, buf: &[u8]) -> isize {
        self.send_raw(buf)
    }

    /// Copy bytes into the write ring. Returns the bytes accepted, which may
    /// be short when the ring is near capacity.
    pub fn write_temp(&self, buf: &[u8]) -> usize {
        self.rings().write.copy_in(buf)
    }

    /// Drain the write ring to the socket.
    ///
    /// Returns the bytes still buffered (0 when fully drained), or the
    /// `write` error codes.
    pub fn commit_write(&self) -> isize {
        let mut rings = self.rings();
        self.flush_write_ring(&mut rings)
    }

    /// Drain the write ring, then stream the read ring directly to the
    /// socket. The read ring is only touched once the write ring is empty.
    /// Returns total bytes written, or the `write` error codes.
    pub fn write_back(&self) -> isize {
        let mut rings = self.rings();

        let buffered = rings.write.bytes_readable();
        let remaining = self.flush_write_ring(&mut rings);
        if remaining < 0 {
            return remaining;
        }
        let mut total = (buffered - remaining as usize) as isize;
        if remaining > 0 {
            return total;
        }

        loop {
            let span = rings.read.linear_read_span();
            if span.is_empty() {
                break;
            }
            let n = self.send_raw(span);
            if n > 0 {
                rings.read.commit_read(n as usize);
                total += n;
            } else if n == 0 {
                break;
            } else {
                return n;
            }
        }
        total
    }

    /// Move bytes from the read ring into the write ring in memory. Returns
    /// the bytes moved, bounded by read occupancy and write free space.
    pub fn move_to_write_buffer(&self) -> usize {
        let mut rings = self.rings();
        let RingPair { read, write } = &mut *rings;
        let mut moved = 0;
        loop {
            let src = read.linear_read_span();
            if src.is_empty() {
                break;
            }
            let dst = write.linear_write_span();
            let n = src.len().min(dst.len());
            if n == 0 {
                break;
            }
            dst[..n].copy_from_slice(&src[..n]);
            write.commit_write(n);
            read.commit_read(n);
            moved += n;
        }
        moved
    }

    pub fn bytes_in_read_buffer(&self) -> usize {
        self.rings().read.bytes_readable()
    }

    pub fn bytes_in_write_buffer(&self) -> usize {
        self.rings().write.bytes_readable()
    }

    /// Rearm one-shot readiness with the given interest.
    ///
    /// Returns true on success. A false return is fatal for the connection:
    /// the caller must invoke [`close`](Self::close).
    pub fn enable_events(&self, read: bool, write: bool) -> bool {
        if self.arm(read, write) {
            let mut bits = 0;
            if read {
                bits |= Interest::READ.bits();
            }
            if write {
                bits |= Interest::WRITE.bits();
            }
            self.events.store(bits, Ordering::Release);
            true
        } else {
            self.events.store(0, Ordering::Release);
            false
        }
    }

    /// Rearm with the last-requested interest.
    pub fn renable_events(&self) -> bool {
        let bits = self.events.load(Ordering::Acquire);
        let ok = self.arm(
            bits & Interest::READ.bits() != 0,
            bits & Interest::WRITE.bits() != 0,
        );
        if !ok {
            self.events.store(0, Ordering::Release);
        }
        ok
    }

    /// Schedule destruction on the acceptor thread. Idempotent.
    ///
    /// The fd is removed from the readiness set immediately; the close
    /// callback runs on the next close-list drain.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        unsafe {
            libc::epoll_ctl(
                self.io.epfd,
                libc::EPOLL_CTL_DEL,
                self.raw_fd(),
                std::ptr::null_mut(),
            );
        }
        if let Some(me) = self.weak.upgrade() {
            self.close_list.push(me);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_peer_closed(&self) {
        self.peer_closed.store(true, Ordering::Release);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub(crate) fn loop_idx(&self) -> usize {
        self.loop_idx
    }

    pub(crate) fn rings(&self) -> MutexGuard<'_, RingPair> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_ctx(&self) -> MutexGuard<'_, Option<C>> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn take_ctx(&self) -> Option<C> {
        self.lock_ctx().take()
    }

    /// Drain the socket into the read ring.
    ///
    /// Returns false on a fatal socket error. EOF and would-block both stop
    /// the loop successfully; `EPOLLRDHUP` is what latches peer-closed.
    pub(crate) fn read_socket(&self, rings: &mut RingPair) -> bool {
        loop {
            let span = rings.read.linear_write_span();
            if span.is_empty() {
                return true;
            }
            let want = span.len();
            let n = self.recv_raw(span);
            if n > 0 {
                rings.read.commit_write(n as usize);
                if (n as usize) < want {
                    // Short read: the socket is drained for now; the next
                    // readiness edge delivers the rest.
                    return true;
                }
            } else if n == 0 {
                return true;
            } else {
                return false;
            }
        }
    }

    /// Drain the write ring to the socket. Returns bytes still buffered or
    /// the `write` error codes.
    pub(crate) fn flush_write_ring(&self, rings: &mut RingPair) -> isize {
        loop {
            let span = rings.write.linear_read_span();
            if span.is_empty() {
                return 0;
            }
            let want = span.len();
            let n = self.send_raw(span);
            if n > 0 {
                rings.write.commit_read(n as usize);
                if (n as usize) < want {
                    return rings.write.bytes_readable() as isize;
                }
            } else if n == 0 {
                return rings.write.bytes_readable() as isize;
            } else {
                return n;
            }
        }
    }

    fn arm(&self, read: bool, write: bool) -> bool {
        let mut bits =
            libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLONESHOT;
        if read {
            bits |= libc::EPOLLIN;
        }
        if write {
            bits |= libc::EPOLLOUT;
        }
        let fd = self.raw_fd();
        let mut event = libc::epoll_event {
            events: bits as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.io.epfd, libc::EPOLL_CTL_MOD, fd, &mut event) };
        rc == 0
    }

    /// One `recv` with transparent `EINTR` retry. Returns bytes read, 0 for
    /// EOF or would-block, -1 on any other error.
    fn recv_raw(&self, buf: &mut [u8]) -> isize {
        loop {
            let n = unsafe { libc::recv(self.raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n >= 0 {
                return n as isize;
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return 0;
            }
            return -1;
        }
    }

    /// One `send` with transparent `EINTR` retry and `MSG_NOSIGNAL`.
    fn send_raw(&self, buf: &[u8]) -> isize {
        loop {
            let n = unsafe {
                libc::send(
                    self.raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return n as isize;
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return 0;
            }
            if errno == libc::EPIPE || errno == libc::ECONNRESET {
                self.set_peer_closed();
                return WRITE_PEER_CLOSED;
            }
            return WRITE_ERR;
        }
    }
}
