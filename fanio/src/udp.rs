//! UDP server runtime.
//!
//! One socket per hardware thread, all bound to the same port with
//! `SO_REUSEPORT` so the kernel spreads datagrams across receivers. Each
//! receiver uses a short receive timeout to re-check the exit flag. Datagram
//! dispatch either runs inline on the receiver thread or is staged into
//! pool-buffer tasks for the worker pool.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::UdpConfig;
use crate::error::Error;
use crate::pool::{BufferPool, PoolBuffer};
use crate::queue::{self, WorkerPool};
use crate::signal;
use crate::sockopt;
use crate::tcp::{ExitFlag, ShutdownHandle};

/// Datagram pool slab sizing; the pool grows by slabs on demand, so these
/// only tune allocation granularity and retention.
const DGRAM_SLAB_COUNT: usize = 16;
const DGRAM_MIN_RETAINED: usize = 64;

/// Receive timeout so receiver threads observe the exit flag promptly.
const RECV_TICK: Duration = Duration::from_millis(50);

/// Datagram callbacks.
pub trait UdpHandler: Send + Sync + 'static {
    /// A datagram arrived on `sock`. Responses go out via
    /// [`UdpSocketRef::send_to`].
    fn on_datagram(&self, sock: UdpSocketRef, data: &[u8], peer: SocketAddr);
}

/// Identifies the receiver socket a datagram arrived on, and carries the
/// response send path.
#[derive(Debug, Clone, Copy)]
pub struct UdpSocketRef {
    fd: RawFd,
    id: usize,
}

impl UdpSocketRef {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Send one datagram. Succeeds only if the whole payload was accepted.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        let sa = socket2::SockAddr::from(addr);
        let n = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr().cast(),
                data.len(),
                0,
                sa.as_ptr().cast(),
                sa.len(),
            )
        };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if n as usize != data.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short datagram send",
            )));
        }
        Ok(())
    }
}

struct UdpTask {
    sock: UdpSocketRef,
    buf: PoolBuffer,
    len: usize,
    peer: SocketAddr,
}

/// Event-driven UDP server.
pub struct UdpServer<H: UdpHandler> {
    cfg: UdpConfig,
    handler: Option<Arc<H>>,
    socks: Vec<Socket>,
    exit: ExitFlag,
    loop_ran: bool,
}

impl<H: UdpHandler> UdpServer<H> {
    pub fn new(cfg: UdpConfig) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(UdpServer {
            cfg,
            handler: None,
            socks: Vec::new(),
            exit: ExitFlag::new(),
            loop_ran: false,
        })
    }

    /// Open one `SO_REUSEPORT` socket per hardware thread on the given
    /// port. `ip = None` binds the IPv4 any-address. One-shot.
    pub fn bind(&mut self, port: u16, ip: Option<IpAddr>) -> Result<(), Error> {
        if !self.socks.is_empty() {
            return Err(Error::State("bind() cannot be called multiple times"));
        }

        let ip = ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, port);
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let receivers = queue::num_cpus();

        let mut socks = Vec::with_capacity(receivers);
        for _ in 0..receivers {
            let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
            sock.set_reuse_address(true)?;
            sockopt::set_reuseport(sock.as_raw_fd())?;
            sockopt::set_recv_buffer(sock.as_raw_fd(), self.cfg.recv_bsize)?;
            sockopt::set_recv_timeout(sock.as_raw_fd(), RECV_TICK)?;
            sock.bind(&addr.into())?;
            socks.push(sock);
        }

        info!("Bound {} receiver sockets to port: {port}", socks.len());
        self.socks = socks;
        Ok(())
    }

    /// Register the datagram handler.
    pub fn set_handler(&mut self, handler: H) {
        self.handler = Some(Arc::new(handler));
    }

    /// Install a signal handler that initiates graceful shutdown.
    pub fn set_signal_exit(&mut self, signum: i32) -> Result<(), Error> {
        signal::install(signum)?;
        info!("Exit signal handler configured for signal: {signum}");
        Ok(())
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.exit.clone())
    }

    /// Send one datagram from the given receiver socket.
    pub fn send_to(
        &self,
        socket_id: usize,
        data: &[u8],
        ip: IpAddr,
        port: u16,
    ) -> Result<(), Error> {
        let sock = self
            .socks
            .get(socket_id)
            .ok_or(Error::State("bind() not called or bad socket id"))?;
        UdpSocketRef {
            fd: sock.as_raw_fd(),
            id: socket_id,
        }
        .send_to(data, SocketAddr::new(ip, port))
    }

    /// Run the receiver set. Blocks the calling thread (which becomes
    /// receiver 0) until the exit flag is set or a registered exit signal
    /// fires. One-shot.
    pub fn event_loop(&mut self) -> Result<(), Error> {
        if self.loop_ran {
            return Err(Error::State("event_loop() cannot be called multiple times"));
        }
        self.loop_ran = true;

        if self.socks.is_empty() {
            return Err(Error::State("bind() not called"));
        }
        let handler = self
            .handler
            .clone()
            .ok_or(Error::State("set_handler() not called"))?;

        let max_size = self.cfg.datagram_bsize();

        // Optional worker pool for batched dispatch.
        let mut workers: Option<WorkerPool> = None;
        let mut senders: Vec<Option<Sender<UdpTask>>> = Vec::new();
        let pool = if self.cfg.worker_threads > 0 {
            let pool = BufferPool::new(max_size, DGRAM_SLAB_COUNT, DGRAM_MIN_RETAINED);
            let mut rxs = Vec::with_capacity(self.socks.len());
            senders = Vec::with_capacity(self.socks.len());
            for _ in 0..self.socks.len() {
                let (tx, rx) =
                    crossbeam_channel::bounded::<UdpTask>(self.cfg.worker_queue_length);
                senders.push(Some(tx));
                rxs.push(rx);
            }
            let worker_handler = Arc::clone(&handler);
            workers = Some(
                queue::spawn_workers(
                    "fanio-udp-worker",
                    self.cfg.worker_threads,
                    self.cfg.worker_batch_process,
                    &rxs,
                    move |task: UdpTask| {
                        worker_handler.on_datagram(
                            task.sock,
                            &task.buf.as_slice()[..task.len],
                            task.peer,
                        );
                    },
                )
                .map_err(Error::Io)?,
            );
            Some(pool)
        } else {
            None
        };

        info!(
            "Event loop started: {} receivers, {} workers",
            self.socks.len(),
            self.cfg.worker_threads
        );

        // Receivers 1..N on their own threads; receiver 0 on this thread.
        let mut rx_threads = Vec::with_capacity(self.socks.len().saturating_sub(1));
        for (id, sock) in self.socks.iter().enumerate().skip(1) {
            let fd = sock.as_raw_fd();
            let exit = self.exit.clone();
            let dispatch = match (&pool, senders.get_mut(id).and_then(|tx| tx.take())) {
                (Some(pool), Some(tx)) => Dispatch::Queued {
                    pool: Arc::clone(pool),
                    tx,
                },
                _ => Dispatch::Inline(Arc::clone(&handler)),
            };
            let handle = thread::Builder::new()
                .name(format!("fanio-udp-rx-{id}"))
                .spawn(move || run_receiver(fd, id, dispatch, max_size, exit))
                .map_err(Error::Io)?;
            rx_threads.push(handle);
        }

        let dispatch0 = match (&pool, senders.first_mut().and_then(|tx| tx.take())) {
            (Some(pool), Some(tx)) => Dispatch::Queued {
                pool: Arc::clone(pool),
                tx,
            },
            _ => Dispatch::Inline(Arc::clone(&handler)),
        };
        run_receiver(
            self.socks[0].as_raw_fd(),
            0,
            dispatch0,
            max_size,
            self.exit.clone(),
        );

        for handle in rx_threads {
            let _ = handle.join();
        }
        // Receivers owned every queue sender; the workers are now starved
        // and exit as their queues disconnect.
        drop(senders);
        if let Some(workers) = workers {
            workers.join();
        }

        info!("Event loop exited");
        Ok(())
    }
}

enum Dispatch<H: UdpHandler> {
    Inline(Arc<H>),
    Queued { pool: Arc<BufferPool>, tx: Sender<UdpTask> },
}

fn run_receiver<H: UdpHandler>(
    fd: RawFd,
    id: usize,
    dispatch: Dispatch<H>,
    max_size: usize,
    exit: ExitFlag,
) {
    let mut buf = vec![0u8; max_size];

    while !exit.is_set() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut addrlen,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            // The receive timeout surfaces as EAGAIN and doubles as the
            // exit-flag poll tick.
            if errno == libc::EINTR || errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                continue;
            }
            error!("recvfrom() failed: {err}");
            exit.set();
            return;
        }
        let n = n as usize;

        let Some(peer) = sockaddr_to_socketaddr(&storage) else {
            continue;
        };
        let sock = UdpSocketRef { fd, id };

        match &dispatch {
            Dispatch::Inline(handler) => handler.on_datagram(sock, &buf[..n], peer),
            Dispatch::Queued { pool, tx } => {
                let Some(mut pb) = pool.get() else {
                    warn!("datagram pool exhausted, dropping datagram from {peer}");
                    continue;
                };
                pb.as_mut_slice()[..n].copy_from_slice(&buf[..n]);
                let task = UdpTask {
                    sock,
                    buf: pb,
                    len: n,
                    peer,
                };
                // Unlike TCP there is no readiness to re-arm; a saturated
                // queue drops the datagram, which UDP callers must already
                // tolerate.
                if tx.try_send(task).is_err() {
                    debug!("udp worker queue full, dropping datagram from {peer}");
                }
            }
        }
    }
}

fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopUdp;

    impl UdpHandler for NopUdp {
        fn on_datagram(&self, _sock: UdpSocketRef, _data: &[u8], _peer: SocketAddr) {}
    }

    #[test]
    fn event_loop_requires_bind() {
        let mut server = UdpServer::<NopUdp>::new(UdpConfig::default()).unwrap();
        server.set_handler(NopUdp);
        assert!(matches!(server.event_loop(), Err(Error::State(_))));
    }

    #[test]
    fn bind_is_one_shot() {
        let mut server = UdpServer::<NopUdp>::new(UdpConfig::default()).unwrap();
        server.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        assert!(server.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).is_err());
    }

    #[test]
    fn send_to_requires_bind() {
        let server = UdpServer::<NopUdp>::new(UdpConfig::default()).unwrap();
        let err = server.send_to(0, b"x", IpAddr::V4(Ipv4Addr::LOCALHOST), 9999);
        assert!(err.is_err());
    }

    #[test]
    fn sockaddr_conversion_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = 8080u16.to_be();
        sa.sin_addr.s_addr = u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be();

        let addr = sockaddr_to_socketaddr(&storage).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn sockaddr_conversion_rejects_unknown_family() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert!(sockaddr_to_socketaddr(&storage).is_none());
    }
}
