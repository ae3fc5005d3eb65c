//! Connection storm: many short-lived connections, each sending one byte.
//! Every connect callback must pair with exactly one close callback and the
//! process must not leak descriptors.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fanio::{Conn, Handler, TcpConfig, TcpServer};

const CONNECTIONS: usize = 1000;

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    bytes: AtomicUsize,
}

struct Sink {
    counters: Arc<Counters>,
}

impl Handler for Sink {
    type Ctx = ();

    fn on_connect(&self, _peer: SocketAddr) {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_read(&self, conn: &Conn<()>, _ctx: &mut ()) {
        let mut buf = [0u8; 64];
        loop {
            let n = conn.read(&mut buf);
            if n == 0 {
                break;
            }
            self.counters.bytes.fetch_add(n, Ordering::SeqCst);
        }

        if conn.is_peer_closed() {
            conn.close();
        } else if !conn.enable_events(true, false) {
            conn.close();
        }
    }

    fn on_close(&self, _conn: &Conn<()>, _ctx: &mut ()) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn storm_pairs_connect_and_close() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let fds_before = open_fd_count();

    let counters = Arc::new(Counters::default());
    let mut server = TcpServer::new(TcpConfig::default()).unwrap();
    server.set_handler(Sink {
        counters: counters.clone(),
    });
    server
        .listen(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        server.event_loop().unwrap();
    });

    for i in 0..CONNECTIONS {
        let mut client = TcpStream::connect(("127.0.0.1", port))
            .unwrap_or_else(|e| panic!("connect {i} failed: {e}"));
        client.write_all(&[b'x']).unwrap();
        // Drop sends FIN; the server closes its side after draining.
    }

    // All connects and closes must settle; close processing is batched on
    // the acceptor's 50 ms tick.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let connects = counters.connects.load(Ordering::SeqCst);
        let closes = counters.closes.load(Ordering::SeqCst);
        if connects == CONNECTIONS && closes == CONNECTIONS {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "storm did not settle: {connects} connects, {closes} closes"
        );
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(counters.bytes.load(Ordering::SeqCst), CONNECTIONS);

    shutdown.set_exit_flag();
    server_thread.join().unwrap();

    // No further close callbacks may appear during shutdown.
    assert_eq!(counters.closes.load(Ordering::SeqCst), CONNECTIONS);

    // Descriptors: everything the storm opened is gone; tolerate harness
    // noise.
    let fds_after = open_fd_count();
    assert!(
        fds_after <= fds_before + 8,
        "descriptor leak: {fds_before} before, {fds_after} after"
    );
}
