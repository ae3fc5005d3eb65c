//! UDP echo: answers every datagram from the socket it arrived on.
//!
//! Try it with `nc -u 127.0.0.1 4568`.

use std::net::SocketAddr;

use fanio::{UdpConfig, UdpHandler, UdpServer, UdpSocketRef};

struct Echo;

impl UdpHandler for Echo {
    fn on_datagram(&self, sock: UdpSocketRef, data: &[u8], peer: SocketAddr) {
        if let Err(e) = sock.send_to(data, peer) {
            eprintln!("echo to {peer} failed: {e}");
        }
    }
}

fn main() -> Result<(), fanio::Error> {
    let cfg = UdpConfig {
        min_log_level: tracing::Level::INFO,
        ..UdpConfig::default()
    };
    fanio::logging::init(cfg.min_log_level);

    let mut server = UdpServer::new(cfg)?;
    server.set_handler(Echo);
    server.set_signal_exit(libc::SIGINT)?;
    server.bind(4568, None)?;
    server.event_loop()
}
