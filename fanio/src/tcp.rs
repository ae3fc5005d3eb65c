//! TCP server runtime.
//!
//! A [`TcpServer`] owns all subsystems — buffer pools, I/O loops, worker
//! pool, acceptor — and composes them in an explicit order when
//! [`event_loop`](TcpServer::event_loop) runs. Multiple independent servers
//! may coexist in one process.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::acceptor::{Acceptor, AcceptorOpts, LoopRefs};
use crate::config::{TcpConfig, WaterMark};
use crate::connection::CloseList;
use crate::error::Error;
use crate::handler::Handler;
use crate::io_loop::{run_io_loop, ConnTable, IoLoopShared};
use crate::pool::BufferPool;
use crate::queue::{self, Stage, Task};
use crate::signal;
use crate::sockopt::{self, KeepAlive};

/// Combined instance + signal exit condition polled by every loop.
#[derive(Clone)]
pub(crate) struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub(crate) fn new() -> Self {
        ExitFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) || signal::triggered()
    }
}

/// Clonable handle for initiating shutdown from outside the event loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    exit: ExitFlag,
}

impl ShutdownHandle {
    pub(crate) fn new(exit: ExitFlag) -> Self {
        ShutdownHandle { exit }
    }

    /// Ask the event loop to exit. The loop returns within one accept tick
    /// plus one wakeup round-trip.
    pub fn set_exit_flag(&self) {
        self.exit.set();
    }
}

/// Event-driven TCP server.
pub struct TcpServer<H: Handler> {
    cfg: TcpConfig,
    handler: Option<Arc<H>>,
    listener: Option<Socket>,
    watermark: WaterMark,
    keepalive: Option<KeepAlive>,
    linger_secs: Option<i32>,
    exit: ExitFlag,
    loop_ran: bool,
}

impl<H: Handler> TcpServer<H> {
    pub fn new(cfg: TcpConfig) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(TcpServer {
            cfg,
            handler: None,
            listener: None,
            watermark: WaterMark::default(),
            keepalive: None,
            linger_secs: None,
            exit: ExitFlag::new(),
            loop_ran: false,
        })
    }

    /// Bind and listen. `ip = None` listens on the IPv4 any-address; pass an
    /// explicit `IpAddr::V6` to listen on IPv6. One-shot.
    pub fn listen(&mut self, port: u16, ip: Option<IpAddr>) -> Result<(), Error> {
        if self.listener.is_some() {
            return Err(Error::State("listen() cannot be called multiple times"));
        }

        let ip = ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, port);
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sockopt::set_reuseport(sock.as_raw_fd())?;
        sock.bind(&addr.into())?;
        sock.listen(libc::SOMAXCONN)?;
        // Non-blocking so a connection that vanishes between poll() and
        // accept() cannot park the acceptor.
        sock.set_nonblocking(true)?;

        info!("Started listening on port: {port}");
        self.listener = Some(sock);
        Ok(())
    }

    /// Register the event handler.
    pub fn set_handler(&mut self, handler: H) {
        self.handler = Some(Arc::new(handler));
    }

    /// Configure dispatch watermarks. See [`WaterMark`].
    pub fn set_watermark(&mut self, read_mark: u32, write_mark: u32) {
        self.watermark = WaterMark {
            read_mark,
            write_mark,
        };
    }

    /// Configure `SO_LINGER` applied to accepted connections.
    pub fn enable_linger(&mut self, enable: bool, wait_secs: i32) -> Result<(), Error> {
        if !enable {
            self.linger_secs = None;
            return Ok(());
        }
        if wait_secs <= 0 {
            return Err(Error::Config(
                "linger wait_secs must be positive".to_string(),
            ));
        }
        self.linger_secs = Some(wait_secs);
        Ok(())
    }

    /// Configure TCP keepalive applied to accepted connections.
    pub fn enable_keepalive(
        &mut self,
        enable: bool,
        idle_secs: i32,
        probes: i32,
        interval_secs: i32,
    ) -> Result<(), Error> {
        if !enable {
            self.keepalive = None;
            return Ok(());
        }
        if idle_secs <= 0 || probes <= 0 || interval_secs <= 0 {
            return Err(Error::Config(
                "keepalive idle_secs, probes and interval_secs must be positive".to_string(),
            ));
        }
        self.keepalive = Some(KeepAlive {
            idle_secs,
            probes,
            interval_secs,
        });
        Ok(())
    }

    /// Install a signal handler that initiates graceful shutdown. The
    /// handler only stores a flag; all cleanup runs on the event loop's
    /// threads.
    pub fn set_signal_exit(&mut self, signum: i32) -> Result<(), Error> {
        signal::install(signum)?;
        info!("Exit signal handler configured for signal: {signum}");
        Ok(())
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            exit: self.exit.clone(),
        }
    }

    /// Run the reactor. Blocks the calling thread (which becomes the
    /// acceptor) until the exit flag is set or a registered exit signal
    /// fires. One-shot.
    pub fn event_loop(&mut self) -> Result<(), Error> {
        if self.loop_ran {
            return Err(Error::State("event_loop() cannot be called multiple times"));
        }
        self.loop_ran = true;

        let listener = self
            .listener
            .as_ref()
            .ok_or(Error::State("listen() not called"))?;
        let handler = self
            .handler
            .clone()
            .ok_or(Error::State("set_handler() not called"))?;

        let (io_count, worker_count) = thread_counts(self.cfg.worker_thread_ratio);

        let read_pool = BufferPool::new(
            self.cfg.read_bsize,
            self.cfg.pool_slab_count,
            self.cfg.pool_min_retained,
        );
        let write_pool = BufferPool::new(
            self.cfg.write_bsize,
            self.cfg.pool_slab_count,
            self.cfg.pool_min_retained,
        );
        let close_list = CloseList::new();

        // I/O loops, each with an epoll set, a wakeup fd and a task queue.
        let mut loops: Vec<LoopRefs<H::Ctx>> = Vec::with_capacity(io_count);
        let mut receivers = Vec::with_capacity(io_count);
        let mut io_threads = Vec::with_capacity(io_count);

        for i in 0..io_count {
            let shared = IoLoopShared::new()?;
            let table = ConnTable::new();
            let (tx, rx) = crossbeam_channel::bounded::<Task<H::Ctx>>(self.cfg.worker_queue_length);
            receivers.push(rx);
            loops.push(LoopRefs {
                shared: Arc::clone(&shared),
                table: Arc::clone(&table),
            });

            let stage = Stage::new(tx, self.cfg.worker_batch_submit);
            let wm = self.watermark;
            let max_events = self.cfg.epoll_max_events;
            let exit = self.exit.clone();
            let handle = thread::Builder::new()
                .name(format!("fanio-io-{i}"))
                .spawn(move || {
                    run_io_loop(
                        shared,
                        table,
                        stage,
                        wm,
                        max_events,
                        H::HANDLES_READ,
                        H::HANDLES_WRITE,
                        exit,
                    );
                })
                .map_err(Error::Io)?;
            io_threads.push(handle);
        }

        // Workers, draining the loops' queues.
        let worker_handler = Arc::clone(&handler);
        let workers = queue::spawn_workers(
            "fanio-worker",
            worker_count,
            self.cfg.worker_batch_process,
            &receivers,
            move |task: Task<H::Ctx>| {
                let conn = task.conn;
                let mut guard = conn.lock_ctx();
                if let Some(ctx) = guard.as_mut() {
                    match task.kind {
                        queue::TaskKind::Read => worker_handler.on_read(&conn, ctx),
                        queue::TaskKind::Write => worker_handler.on_write(&conn, ctx),
                    }
                }
            },
        )
        .map_err(Error::Io)?;
        drop(receivers);

        info!(
            "Event loop started: {io_count} I/O loops, {worker_count} workers"
        );

        let acceptor = Acceptor {
            listener,
            handler: &handler,
            loops: &loops,
            close_list: &close_list,
            read_pool: &read_pool,
            write_pool: &write_pool,
            opts: AcceptorOpts {
                keepalive: self.keepalive,
                linger_secs: self.linger_secs,
                default_interest: self.cfg.default_interest,
            },
            exit: self.exit.clone(),
        };
        let result = acceptor.run();

        // Shutdown: wake every loop out of epoll_wait, join them (their
        // queue senders drop with them), then the starved workers exit.
        for l in &loops {
            l.shared.wake();
        }
        for handle in io_threads {
            let _ = handle.join();
        }
        workers.join();

        // Close callbacks may have queued more teardown work while the
        // loops were winding down.
        acceptor.drain_close_list();

        // Defensive sweep: anything still live gets its close callback
        // exactly once before the tables drop.
        let mut leftover = 0;
        for l in &loops {
            for conn in l.table.drain_all() {
                if let Some(mut ctx) = conn.take_ctx() {
                    handler.on_close(&conn, &mut ctx);
                }
                leftover += 1;
                info!("Connection force closed: {}", conn.peer_label());
            }
        }
        if leftover > 0 {
            warn!("Cleaned up {leftover} unclosed connections");
        }

        info!("Event loop exited");
        result
    }
}

/// Split hardware threads between I/O loops and workers, clamping both to at
/// least one.
pub(crate) fn thread_counts(worker_ratio: f32) -> (usize, usize) {
    let hw = queue::num_cpus();
    if hw <= 2 {
        return (1, 1);
    }
    let mut workers = (hw as f32 * worker_ratio + 0.5) as usize;
    let mut io = hw - workers;
    if workers == 0 {
        workers = 1;
        io -= 1;
    } else if io == 0 {
        io = 1;
        workers -= 1;
    }
    (io, workers)
}
