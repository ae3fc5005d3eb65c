//! Acceptor loop.
//!
//! Runs on the thread that called `event_loop`. Waits on the listening
//! socket with a ~50 ms tick that bounds close-callback latency, hands new
//! connections to the least-loaded I/O loop, and owns the deferred-close
//! drain so connection teardown always happens on this thread.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::Socket;
use tracing::{error, info, warn};

use crate::config::Interest;
use crate::connection::{CloseList, Conn};
use crate::error::Error;
use crate::handler::Handler;
use crate::io_loop::{ConnTable, IoLoopShared};
use crate::pool::BufferPool;
use crate::sockopt::{self, KeepAlive};
use crate::tcp::ExitFlag;

/// Close-list drain cadence; also the acceptor's poll timeout ceiling.
const CLOSE_TICK: Duration = Duration::from_millis(50);

pub(crate) struct LoopRefs<C> {
    pub shared: Arc<IoLoopShared>,
    pub table: Arc<ConnTable<C>>,
}

pub(crate) struct AcceptorOpts {
    pub keepalive: Option<KeepAlive>,
    pub linger_secs: Option<i32>,
    pub default_interest: Interest,
}

pub(crate) struct Acceptor<'a, H: Handler> {
    pub listener: &'a Socket,
    pub handler: &'a Arc<H>,
    pub loops: &'a [LoopRefs<H::Ctx>],
    pub close_list: &'a Arc<CloseList<H::Ctx>>,
    pub read_pool: &'a Arc<BufferPool>,
    pub write_pool: &'a Arc<BufferPool>,
    pub opts: AcceptorOpts,
    pub exit: ExitFlag,
}

impl<H: Handler> Acceptor<'_, H> {
    /// Drive accept + close-list processing until the exit flag is observed.
    pub fn run(&self) -> Result<(), Error> {
        // Reserved fd: on EMFILE we close this, accept-and-drop one
        // connection to unstick the backlog, then reopen it.
        let mut idle_fd = Some(File::open("/dev/null")?);

        let listen_fd = self.listener.as_raw_fd();
        let mut last_drain = Instant::now();

        while !self.exit.is_set() {
            let elapsed = last_drain.elapsed();
            let timeout = CLOSE_TICK.saturating_sub(elapsed).as_millis() as libc::c_int;

            let mut pfd = libc::pollfd {
                fd: listen_fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("poll() on listener failed: {err}");
                return Err(Error::Io(err));
            }

            if last_drain.elapsed() >= CLOSE_TICK {
                self.drain_close_list();
                last_drain = Instant::now();
            }

            if rc > 0 {
                self.handle_accept(&mut idle_fd);
            }
        }

        // Final drain so callers that closed right before shutdown still get
        // their close callbacks through the normal path.
        self.drain_close_list();
        Ok(())
    }

    /// Run the user close callback, detach the connection from its loop and
    /// release its fd, for everything queued since the last tick.
    pub fn drain_close_list(&self) {
        let batch = self.close_list.take_batch();
        for conn in batch {
            let refs = &self.loops[conn.loop_idx()];
            if refs.table.remove(conn.raw_fd()).is_some() {
                refs.shared
                    .live
                    .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            }
            if let Some(mut ctx) = conn.take_ctx() {
                self.handler.on_close(&conn, &mut ctx);
            }
            info!("Connection closed: {}", conn.peer_label());
            // Dropping the last Arc closes the fd.
        }
    }

    fn handle_accept(&self, idle_fd: &mut Option<File>) {
        let (sock, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    return;
                }
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.shed_connection(idle_fd);
                }
                error!("accept() failed: {e}");
                return;
            }
        };

        let Some(peer) = addr.as_socket() else {
            warn!("accepted connection with non-inet address, dropping");
            return;
        };

        if let Err(e) = sock.set_nonblocking(true) {
            error!("set_nonblocking on accepted socket failed: {e}");
            return;
        }

        let fd = sock.as_raw_fd();
        if let Some(ka) = self.opts.keepalive {
            sockopt::set_keepalive(fd, ka);
        }
        if let Some(secs) = self.opts.linger_secs {
            sockopt::set_linger(fd, secs);
        }

        let ctx = self.handler.on_connect(peer);

        let (idx, target) = least_loaded(self.loops);

        let (Some(read_buf), Some(write_buf)) = (self.read_pool.get(), self.write_pool.get())
        else {
            warn!(
                "buffer pool exhausted, refusing connection from [{}]:{}",
                peer.ip(),
                peer.port()
            );
            // ctx and the socket drop here; the connection never existed as
            // far as the I/O loops are concerned.
            return;
        };

        let conn = Conn::new(
            sock,
            peer,
            ctx,
            idx,
            Arc::clone(&target.shared),
            Arc::clone(self.close_list),
            read_buf,
            write_buf,
            self.opts.default_interest,
        );

        // Insert before registering: the loop may see an event immediately.
        target.table.insert(fd, Arc::clone(&conn));

        let mut bits =
            libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLONESHOT;
        if self.opts.default_interest.is_readable() {
            bits |= libc::EPOLLIN;
        }
        if self.opts.default_interest.is_writable() {
            bits |= libc::EPOLLOUT;
        }
        let mut event = libc::epoll_event {
            events: bits as u32,
            u64: fd as u64,
        };
        let rc =
            unsafe { libc::epoll_ctl(target.shared.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            error!(
                "epoll_ctl(EPOLL_CTL_ADD) failed: {}",
                io::Error::last_os_error()
            );
            target.table.remove(fd);
            if let Some(mut ctx) = conn.take_ctx() {
                self.handler.on_close(&conn, &mut ctx);
            }
            return;
        }

        target
            .shared
            .live
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!("Accepted new connection from: {}", conn.peer_label());
    }

    /// EMFILE: briefly free our reserved fd slot, accept the pending
    /// connection just to close it, then take the slot back.
    fn shed_connection(&self, idle_fd: &mut Option<File>) {
        let listen_fd = self.listener.as_raw_fd();
        *idle_fd = None;
        let shed =
            unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if shed >= 0 {
            unsafe { libc::close(shed) };
        }
        match File::open("/dev/null") {
            Ok(f) => *idle_fd = Some(f),
            // Still saturated; the next EMFILE round retries the reopen.
            Err(e) => warn!("failed to reopen reserved fd: {e}"),
        }
    }
}

fn least_loaded<C>(loops: &[LoopRefs<C>]) -> (usize, &LoopRefs<C>) {
    let mut best = 0;
    let mut best_count = usize::MAX;
    for (i, l) in loops.iter().enumerate() {
        let count = l.shared.live.load(std::sync::atomic::Ordering::Relaxed);
        if count < best_count {
            best = i;
            best_count = count;
        }
    }
    (best, &loops[best])
}
