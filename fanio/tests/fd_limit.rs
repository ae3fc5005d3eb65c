//! Descriptor exhaustion: with `RLIMIT_NOFILE` squeezed, surplus connections
//! are shed through the reserved-fd path while established connections keep
//! working.
//!
//! Runs alone in its own binary because the rlimit applies process-wide.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fanio::{Conn, Handler, TcpConfig, TcpServer};

const ATTEMPTS: usize = 200;

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
}

struct Echo {
    counters: Arc<Counters>,
}

impl Handler for Echo {
    type Ctx = ();

    fn on_connect(&self, _peer: SocketAddr) {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_read(&self, conn: &Conn<()>, _ctx: &mut ()) {
        conn.move_to_write_buffer();
        if conn.commit_write() < 0 {
            conn.close();
            return;
        }
        if conn.is_peer_closed() && conn.bytes_in_read_buffer() == 0 {
            conn.close();
            return;
        }
        if !conn.enable_events(true, false) {
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

fn get_nofile() -> libc::rlimit {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    assert_eq!(rc, 0);
    rlim
}

fn set_nofile(rlim: &libc::rlimit) {
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, rlim) };
    assert_eq!(rc, 0);
}

#[test]
fn emfile_sheds_surplus_connections() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let counters = Arc::new(Counters::default());
    let mut server = TcpServer::new(TcpConfig::default()).unwrap();
    server.set_handler(Echo {
        counters: counters.clone(),
    });
    server
        .listen(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        server.event_loop().unwrap();
    });

    // One connection established while descriptors are plentiful; it must
    // survive the storm.
    let mut canary = TcpStream::connect(("127.0.0.1", port)).unwrap();
    canary
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    canary.write_all(b"hi").unwrap();
    let mut reply = [0u8; 2];
    canary.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hi");

    // Squeeze the process: room for the client sockets plus a few dozen
    // accepted ones, far fewer than ATTEMPTS needs.
    let saved = get_nofile();
    let squeezed = libc::rlimit {
        rlim_cur: (open_fd_count() + ATTEMPTS / 2) as libc::rlim_t,
        rlim_max: saved.rlim_max,
    };
    set_nofile(&squeezed);

    let mut clients = Vec::new();
    let mut client_failures = 0usize;
    for _ in 0..ATTEMPTS {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => clients.push(stream),
            // The squeeze also caps our own socket() calls.
            Err(_) => client_failures += 1,
        }
    }

    // Let the acceptor chew through the backlog and the shed path.
    thread::sleep(Duration::from_millis(500));

    let accepted = counters.connects.load(Ordering::SeqCst);
    assert!(accepted >= 1, "nothing was accepted");
    assert!(
        accepted < 1 + ATTEMPTS,
        "every connection was accepted; the limit never bit"
    );
    assert!(
        client_failures > 0 || accepted < ATTEMPTS,
        "descriptor pressure never materialized"
    );

    // The canary still echoes: the listener did not wedge on EMFILE.
    canary.write_all(b"ok").unwrap();
    canary.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");

    set_nofile(&saved);
    drop(clients);
    drop(canary);

    shutdown.set_exit_flag();
    server_thread.join().unwrap();

    assert_eq!(
        counters.connects.load(Ordering::SeqCst),
        counters.closes.load(Ordering::SeqCst),
        "every connect callback must pair with exactly one close callback"
    );
}
