//! Echo server: moves whatever arrives on the read ring into the write ring
//! and flushes it back to the peer.
//!
//! Try it with `nc 127.0.0.1 4567`.

use std::net::SocketAddr;

use fanio::{Conn, Handler, TcpConfig, TcpServer};

struct Echo;

impl Handler for Echo {
    type Ctx = u64;

    const HANDLES_READ: bool = true;
    const HANDLES_WRITE: bool = true;

    fn on_connect(&self, peer: SocketAddr) -> u64 {
        println!("connected: {peer}");
        0
    }

    fn on_read(&self, conn: &Conn<u64>, echoed: &mut u64) {
        if conn.is_peer_closed() && conn.bytes_in_read_buffer() == 0 {
            conn.close();
            return;
        }

        *echoed += conn.move_to_write_buffer() as u64;
        if conn.commit_write() < 0 {
            conn.close();
            return;
        }

        // Wait for write readiness while the write ring still holds data,
        // otherwise go back to waiting for input.
        let ok = if conn.bytes_in_write_buffer() > 0 {
            conn.enable_events(false, true)
        } else {
            conn.enable_events(true, false)
        };
        if !ok {
            conn.close();
        }
    }

    fn on_write(&self, conn: &Conn<u64>, _echoed: &mut u64) {
        if conn.commit_write() < 0 {
            conn.close();
            return;
        }
        let ok = if conn.bytes_in_write_buffer() > 0 {
            conn.enable_events(false, true)
        } else {
            conn.enable_events(true, false)
        };
        if !ok {
            conn.close();
        }
    }

    fn on_close(&self, conn: &Conn<u64>, echoed: &mut u64) {
        println!("closed: {} after {} bytes", conn.peer_label(), echoed);
    }
}

fn main() -> Result<(), fanio::Error> {
    let cfg = TcpConfig {
        min_log_level: tracing::Level::INFO,
        ..TcpConfig::default()
    };
    fanio::logging::init(cfg.min_log_level);

    let mut server = TcpServer::new(cfg)?;
    server.set_handler(Echo);
    server.enable_keepalive(true, 120, 3, 10)?;
    server.set_signal_exit(libc::SIGINT)?;
    server.listen(4567, None)?;
    server.event_loop()
}
