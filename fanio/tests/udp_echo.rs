//! UDP echo over the `SO_REUSEPORT` receiver set, in both dispatch modes:
//! inline on the receiver threads, and batched through the worker pool.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use fanio::{UdpConfig, UdpHandler, UdpServer, UdpSocketRef};

struct Echo;

impl UdpHandler for Echo {
    fn on_datagram(&self, sock: UdpSocketRef, data: &[u8], peer: SocketAddr) {
        sock.send_to(data, peer).unwrap();
    }
}

fn free_udp_port() -> u16 {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

fn run_echo_round(port: u16, clients: usize) {
    let handles: Vec<_> = (0..clients)
        .map(|i| {
            thread::spawn(move || {
                let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
                sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

                let payload = vec![i as u8; 512];
                let mut reply = [0u8; 2048];

                // Loopback does not lose datagrams under this load, but a
                // bounded retry keeps the test robust on slow machines.
                for attempt in 0..3 {
                    sock.send_to(&payload, ("127.0.0.1", port)).unwrap();
                    match sock.recv_from(&mut reply) {
                        Ok((n, _from)) => {
                            assert_eq!(n, 512, "client {i}: short echo");
                            assert_eq!(&reply[..n], &payload[..], "client {i}: corrupted echo");
                            return;
                        }
                        Err(_) if attempt < 2 => continue,
                        Err(e) => panic!("client {i}: no echo: {e}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn inline_dispatch_echoes_every_datagram() {
    let port = free_udp_port();
    let mut server = UdpServer::new(UdpConfig::default()).unwrap();
    server.set_handler(Echo);
    server
        .bind(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        server.event_loop().unwrap();
    });

    run_echo_round(port, 8);

    shutdown.set_exit_flag();
    server_thread.join().unwrap();
}

#[test]
fn worker_dispatch_echoes_every_datagram() {
    let port = free_udp_port();
    let cfg = UdpConfig {
        worker_threads: 2,
        ..UdpConfig::default()
    };
    let mut server = UdpServer::new(cfg).unwrap();
    server.set_handler(Echo);
    server
        .bind(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        server.event_loop().unwrap();
    });

    run_echo_round(port, 8);

    shutdown.set_exit_flag();
    server_thread.join().unwrap();
}
