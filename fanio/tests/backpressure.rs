//! Write backpressure: the server pushes a large payload through the write
//! ring while the client drains slowly; the write callback keeps firing on
//! write readiness until every byte is delivered.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fanio::{Conn, Handler, Interest, TcpConfig, TcpServer};

const TOTAL: usize = 8 * 1024 * 1024;
const PATTERN: u8 = 0x5A;

struct Blaster {
    closes: Arc<AtomicUsize>,
    write_events: Arc<AtomicUsize>,
}

struct SendState {
    remaining: usize,
}

impl Handler for Blaster {
    type Ctx = SendState;

    const HANDLES_READ: bool = false;
    const HANDLES_WRITE: bool = true;

    fn on_connect(&self, _peer: SocketAddr) -> SendState {
        SendState { remaining: TOTAL }
    }

    fn on_write(&self, conn: &Conn<SendState>, state: &mut SendState) {
        self.write_events.fetch_add(1, Ordering::SeqCst);

        let chunk = [PATTERN; 4096];
        while state.remaining > 0 {
            let want = chunk.len().min(state.remaining);
            let accepted = conn.write_temp(&chunk[..want]);
            if accepted == 0 {
                break;
            }
            state.remaining -= accepted;
        }

        if conn.commit_write() < 0 {
            conn.close();
            return;
        }

        if state.remaining == 0 && conn.bytes_in_write_buffer() == 0 {
            conn.close();
            return;
        }

        if !conn.enable_events(false, true) {
            conn.close();
        }
    }

    fn on_close(&self, _conn: &Conn<SendState>, _state: &mut SendState) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn slow_reader_receives_every_byte() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let closes = Arc::new(AtomicUsize::new(0));
    let write_events = Arc::new(AtomicUsize::new(0));

    let cfg = TcpConfig {
        default_interest: Interest::WRITE,
        ..TcpConfig::default()
    };
    let mut server = TcpServer::new(cfg).unwrap();
    server.set_handler(Blaster {
        closes: closes.clone(),
        write_events: write_events.clone(),
    });
    server
        .listen(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        server.event_loop().unwrap();
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assert!(
                    buf[..n].iter().all(|&b| b == PATTERN),
                    "payload corrupted at offset {received}"
                );
                received += n;
                // Throttle so the server's write ring actually fills.
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("read failed after {received} bytes: {e}"),
        }
    }

    assert_eq!(received, TOTAL);
    // Delivery of 8 MiB through a 32 KiB ring requires many write events.
    assert!(
        write_events.load(Ordering::SeqCst) > 10,
        "write callback fired only {} times",
        write_events.load(Ordering::SeqCst)
    );

    shutdown.set_exit_flag();
    server_thread.join().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
