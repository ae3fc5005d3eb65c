//! Socket option passthroughs.
//!
//! Thin wrappers over `setsockopt` and friends. Per-connection options are
//! non-fatal: a connection is still viable without keepalive or linger, so
//! failures are logged and ignored. Listener/receiver setup options return
//! errors to the caller.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn set_reuseport(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, &on)
}

pub(crate) fn set_recv_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    let val = bytes as libc::c_int;
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &val)
}

pub(crate) fn set_recv_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
}

/// Configure `SO_LINGER`. Logged and ignored on failure.
pub(crate) fn set_linger(fd: RawFd, wait_secs: i32) {
    let lin = libc::linger {
        l_onoff: 1,
        l_linger: wait_secs,
    };
    if let Err(e) = setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &lin) {
        warn!("setsockopt(SO_LINGER) failed: {e}");
    }
}

/// TCP keepalive parameters applied to accepted connections.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepAlive {
    pub idle_secs: i32,
    pub probes: i32,
    pub interval_secs: i32,
}

/// Configure `SO_KEEPALIVE` and the three probe knobs. Logged and ignored on
/// failure.
pub(crate) fn set_keepalive(fd: RawFd, ka: KeepAlive) {
    let on: libc::c_int = 1;
    if let Err(e) = setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &on) {
        warn!("setsockopt(SO_KEEPALIVE) failed: {e}");
    }
    if let Err(e) = setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &ka.idle_secs) {
        warn!("setsockopt(TCP_KEEPIDLE) failed: {e}");
    }
    if let Err(e) = setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &ka.probes) {
        warn!("setsockopt(TCP_KEEPCNT) failed: {e}");
    }
    if let Err(e) = setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &ka.interval_secs) {
        warn!("setsockopt(TCP_KEEPINTVL) failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};

    #[test]
    fn options_apply_to_live_socket() {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&sock);

        set_reuseport(fd).unwrap();
        set_recv_buffer(fd, 256 * 1024).unwrap();
        set_recv_timeout(fd, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn tcp_options_apply() {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&sock);

        // Non-fatal helpers must not panic even on odd values.
        set_keepalive(
            fd,
            KeepAlive {
                idle_secs: 120,
                probes: 3,
                interval_secs: 10,
            },
        );
        set_linger(fd, 5);
    }
}
