//! fanio — event-driven TCP/UDP server runtime.
//!
//! Multiplexes many concurrent sockets onto a small pool of epoll-driven I/O
//! loop threads and an associated worker pool. Applications implement
//! [`Handler`] (TCP) or [`UdpHandler`] (UDP) and drive the runtime through
//! [`TcpServer`] / [`UdpServer`].
//!
//! The moving parts:
//!
//! - one **acceptor** on the caller's thread: accepts, load-balances new
//!   connections across I/O loops, and drains the deferred-close list on a
//!   ~50 ms tick;
//! - N **I/O loops**, each owning an epoll set with one-shot rearming, so at
//!   most one worker task per connection is ever in flight;
//! - W **workers** draining per-loop bounded task queues, with batched
//!   submission and a backpressure path that reposts saturated work to the
//!   kernel instead of blocking or dropping;
//! - a slab-recycling [`BufferPool`] backing every connection's ring pair.
//!
//! ```no_run
//! use fanio::{Conn, Handler, TcpConfig, TcpServer};
//! use std::net::SocketAddr;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Ctx = ();
//!
//!     fn on_connect(&self, _peer: SocketAddr) {}
//!
//!     fn on_read(&self, conn: &Conn<()>, _ctx: &mut ()) {
//!         conn.move_to_write_buffer();
//!         if conn.commit_write() < 0 || !conn.enable_events(true, false) {
//!             conn.close();
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), fanio::Error> {
//!     let mut server = TcpServer::new(TcpConfig::default())?;
//!     server.set_handler(Echo);
//!     server.set_signal_exit(libc::SIGINT)?;
//!     server.listen(4567, None)?;
//!     server.event_loop()
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod ring;
pub mod tcp;
pub mod udp;

mod acceptor;
mod io_loop;
mod queue;
mod signal;
mod sockopt;

pub use config::{Interest, TcpConfig, UdpConfig, WaterMark};
pub use connection::{Conn, WRITE_ERR, WRITE_PEER_CLOSED};
pub use error::Error;
pub use handler::Handler;
pub use pool::{BufferPool, PoolBuffer};
pub use ring::Ring;
pub use tcp::{ShutdownHandle, TcpServer};
pub use udp::{UdpHandler, UdpServer, UdpSocketRef};
