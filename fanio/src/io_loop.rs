//! One-shot epoll I/O loops.
//!
//! Each loop owns an epoll set plus an eventfd the acceptor writes to on
//! shutdown. Connections are registered with `EPOLLONESHOT`, so an event
//! disarms the fd until the application (or the backpressure path) rearms
//! it — which is what serializes callbacks per connection.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::config::WaterMark;
use crate::connection::Conn;
use crate::queue::{Stage, Task, TaskKind};
use crate::tcp::ExitFlag;

/// Per-loop state shared with the acceptor and its connections.
pub(crate) struct IoLoopShared {
    pub epfd: RawFd,
    pub wakefd: RawFd,
    /// Connections assigned to this loop. Read without a lock by the
    /// acceptor's load balancer; staleness is acceptable there.
    pub live: AtomicUsize,
}

impl IoLoopShared {
    pub fn new() -> io::Result<Arc<Self>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wakefd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakefd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32,
            u64: wakefd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wakefd, &mut event) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(wakefd);
            }
            return Err(err);
        }

        Ok(Arc::new(IoLoopShared {
            epfd,
            wakefd,
            live: AtomicUsize::new(0),
        }))
    }

    /// Break the loop out of `epoll_wait` for shutdown.
    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wakefd, (&one as *const u64).cast(), 8);
        }
    }
}

impl Drop for IoLoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wakefd);
        }
    }
}

/// fd -> connection table for one loop. Written by the acceptor, read by the
/// loop on each event.
pub(crate) struct ConnTable<C> {
    map: Mutex<HashMap<RawFd, Arc<Conn<C>>>>,
}

impl<C> ConnTable<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnTable {
            map: Mutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, fd: RawFd, conn: Arc<Conn<C>>) {
        self.lock().insert(fd, conn);
    }

    pub fn remove(&self, fd: RawFd) -> Option<Arc<Conn<C>>> {
        self.lock().remove(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn<C>>> {
        self.lock().get(&fd).cloned()
    }

    pub fn drain_all(&self) -> Vec<Arc<Conn<C>>> {
        self.lock().drain().map(|(_, conn)| conn).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RawFd, Arc<Conn<C>>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drive one I/O loop until the wakeup fd fires or a fatal error occurs.
pub(crate) fn run_io_loop<C: Send + 'static>(
    shared: Arc<IoLoopShared>,
    table: Arc<ConnTable<C>>,
    mut stage: Stage<C>,
    wm: WaterMark,
    max_events: usize,
    handles_read: bool,
    handles_write: bool,
    exit: ExitFlag,
) {
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];

    loop {
        let n = unsafe {
            libc::epoll_wait(
                shared.epfd,
                events.as_mut_ptr(),
                max_events as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            // A broken epoll set is fatal to the whole runtime, not just
            // this loop.
            error!("epoll_wait() failed: {err}");
            exit.set();
            stage.flush();
            return;
        }

        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;

            if fd == shared.wakefd {
                stage.flush();
                return;
            }

            let Some(conn) = table.get(fd) else {
                continue;
            };
            if conn.is_closed() {
                continue;
            }

            let bits = event.events as libc::c_int;

            if bits & (libc::EPOLLHUP | libc::EPOLLERR) != 0 {
                debug!("hangup/error event on {}", conn.peer_label());
                conn.close();
            } else if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0 {
                if bits & libc::EPOLLRDHUP != 0 {
                    conn.set_peer_closed();
                }
                if !handle_read(&conn, &mut stage, wm, handles_read, handles_write) {
                    conn.close();
                }
            } else if bits & libc::EPOLLOUT != 0 {
                if !handle_write(&conn, &mut stage, wm, handles_read, handles_write) {
                    conn.close();
                }
            }
        }

        stage.flush();
    }
}

/// Read-readiness dispatch. Returns false when the connection must close.
fn handle_read<C>(
    conn: &Arc<Conn<C>>,
    stage: &mut Stage<C>,
    wm: WaterMark,
    handles_read: bool,
    handles_write: bool,
) -> bool {
    if !handles_read {
        // Only a write callback is registered; restore write interest.
        return if handles_write {
            conn.enable_events(false, true)
        } else {
            false
        };
    }

    let readable = {
        let mut rings = conn.rings();
        if !conn.read_socket(&mut rings) {
            return false;
        }
        rings.read.bytes_readable()
    };

    if conn.is_peer_closed() && readable == 0 {
        return false;
    }

    if wm.read_mark == 0 || readable >= wm.read_mark as usize {
        stage.push(Task {
            conn: Arc::clone(conn),
            kind: TaskKind::Read,
        });
        true
    } else {
        conn.renable_events()
    }
}

/// Write-readiness dispatch. Returns false when the connection must close.
fn handle_write<C>(
    conn: &Arc<Conn<C>>,
    stage: &mut Stage<C>,
    wm: WaterMark,
    handles_read: bool,
    handles_write: bool,
) -> bool {
    if !handles_write {
        return if handles_read {
            conn.enable_events(true, false)
        } else {
            false
        };
    }

    if conn.is_peer_closed() && conn.bytes_in_read_buffer() == 0 {
        return false;
    }

    if wm.write_mark == u32::MAX {
        stage.push(Task {
            conn: Arc::clone(conn),
            kind: TaskKind::Write,
        });
        return true;
    }

    let buffered = {
        let mut rings = conn.rings();
        let remaining = conn.flush_write_ring(&mut rings);
        if remaining < 0 {
            return false;
        }
        remaining as usize
    };

    if buffered <= wm.write_mark as usize {
        stage.push(Task {
            conn: Arc::clone(conn),
            kind: TaskKind::Write,
        });
        true
    } else {
        conn.renable_events()
    }
}
