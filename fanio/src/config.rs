//! Runtime configuration.
//!
//! Plain structs with `Default` impls; validated once at server construction.

use std::ops::BitOr;

use crate::error::Error;

/// Readiness interest for a connection, as a small bitflag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Dispatch thresholds for read/write callbacks.
///
/// `read_mark == 0` means any readable byte triggers the read callback.
/// `write_mark == u32::MAX` means any send capacity triggers the write
/// callback; otherwise the write callback fires only once the write ring has
/// drained to `write_mark` bytes or fewer.
#[derive(Debug, Clone, Copy)]
pub struct WaterMark {
    pub read_mark: u32,
    pub write_mark: u32,
}

impl Default for WaterMark {
    fn default() -> Self {
        WaterMark {
            read_mark: 0,
            write_mark: u32::MAX,
        }
    }
}

/// Configuration for a [`TcpServer`](crate::tcp::TcpServer).
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Per-connection read ring capacity. Multiple of 1024, at least 1024.
    pub read_bsize: usize,
    /// Per-connection write ring capacity. Multiple of 1024, at least 1024.
    pub write_bsize: usize,
    /// Buffers requested per pool slab allocation (1..=1024).
    pub pool_slab_count: usize,
    /// Free-list length the pool keeps resident before it starts retiring
    /// returned buffers. Must be >= `pool_slab_count`.
    pub pool_min_retained: usize,
    /// Maximum events handled per `epoll_wait` call (1..=65535).
    pub epoll_max_events: usize,
    /// Interest a fresh connection is armed with.
    pub default_interest: Interest,
    /// Capacity of each I/O loop's worker task queue (1..=1_048_576).
    pub worker_queue_length: usize,
    /// Staging-buffer size for batched task submission (1 = submit
    /// immediately). Must be <= `worker_queue_length`.
    pub worker_batch_submit: usize,
    /// Tasks a worker drains per wakeup (1..=1024).
    pub worker_batch_process: usize,
    /// Fraction of hardware threads assigned to workers; the rest drive I/O
    /// loops. Exclusive range (0.0, 1.0).
    pub worker_thread_ratio: f32,
    /// Minimum level for [`crate::logging::init`].
    pub min_log_level: tracing::Level,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            read_bsize: 16 * 1024,
            write_bsize: 32 * 1024,
            pool_slab_count: 16,
            pool_min_retained: 64,
            epoll_max_events: 5000,
            default_interest: Interest::READ,
            worker_queue_length: 10_000,
            worker_batch_submit: 8,
            worker_batch_process: 10,
            worker_thread_ratio: 0.5,
            min_log_level: tracing::Level::WARN,
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.read_bsize < 1024 || self.read_bsize % 1024 != 0 {
            return Err(Error::Config(format!(
                "read_bsize must be a multiple of 1024 and at least 1024, got {}",
                self.read_bsize
            )));
        }
        if self.write_bsize < 1024 || self.write_bsize % 1024 != 0 {
            return Err(Error::Config(format!(
                "write_bsize must be a multiple of 1024 and at least 1024, got {}",
                self.write_bsize
            )));
        }
        if self.pool_slab_count == 0 || self.pool_slab_count > 1024 {
            return Err(Error::Config(format!(
                "pool_slab_count must be in 1..=1024, got {}",
                self.pool_slab_count
            )));
        }
        if self.pool_min_retained < self.pool_slab_count {
            return Err(Error::Config(format!(
                "pool_min_retained ({}) must be >= pool_slab_count ({})",
                self.pool_min_retained, self.pool_slab_count
            )));
        }
        if self.epoll_max_events == 0 || self.epoll_max_events > 65535 {
            return Err(Error::Config(format!(
                "epoll_max_events must be in 1..=65535, got {}",
                self.epoll_max_events
            )));
        }
        if self.worker_queue_length == 0 || self.worker_queue_length > 1_048_576 {
            return Err(Error::Config(format!(
                "worker_queue_length must be in 1..=1048576, got {}",
                self.worker_queue_length
            )));
        }
        if self.worker_batch_submit == 0 || self.worker_batch_submit > self.worker_queue_length {
            return Err(Error::Config(format!(
                "worker_batch_submit must be in 1..=worker_queue_length, got {}",
                self.worker_batch_submit
            )));
        }
        if self.worker_batch_process == 0 || self.worker_batch_process > 1024 {
            return Err(Error::Config(format!(
                "worker_batch_process must be in 1..=1024, got {}",
                self.worker_batch_process
            )));
        }
        if !(self.worker_thread_ratio > 0.0 && self.worker_thread_ratio < 1.0) {
            return Err(Error::Config(format!(
                "worker_thread_ratio must be strictly between 0.0 and 1.0, got {}",
                self.worker_thread_ratio
            )));
        }
        Ok(())
    }
}

/// Configuration for a [`UdpServer`](crate::udp::UdpServer).
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// `SO_RCVBUF` for each receiver socket. Multiple of 1024, at least 200 KiB.
    pub recv_bsize: usize,
    /// Largest datagram payload accepted (1452..=65507).
    pub max_payload: usize,
    /// Worker threads for datagram dispatch. 0 means the receive callback
    /// runs inline on the receiver thread.
    pub worker_threads: usize,
    /// Capacity of each receiver's worker task queue (1..=1_048_576).
    /// Ignored when `worker_threads` is 0.
    pub worker_queue_length: usize,
    /// Tasks a worker drains per wakeup (1..=1024).
    pub worker_batch_process: usize,
    /// Minimum level for [`crate::logging::init`].
    pub min_log_level: tracing::Level,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            recv_bsize: 256 * 1024,
            max_payload: 1452,
            worker_threads: 0,
            worker_queue_length: 10_000,
            worker_batch_process: 10,
            min_log_level: tracing::Level::WARN,
        }
    }
}

impl UdpConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.recv_bsize < 200 * 1024 || self.recv_bsize % 1024 != 0 {
            return Err(Error::Config(format!(
                "recv_bsize must be a multiple of 1024 and at least 200KiB, got {}",
                self.recv_bsize
            )));
        }
        if self.max_payload < 1452 || self.max_payload > 65507 {
            return Err(Error::Config(format!(
                "max_payload must be in 1452..=65507, got {}",
                self.max_payload
            )));
        }
        if self.worker_queue_length == 0 || self.worker_queue_length > 1_048_576 {
            return Err(Error::Config(format!(
                "worker_queue_length must be in 1..=1048576, got {}",
                self.worker_queue_length
            )));
        }
        if self.worker_batch_process == 0 || self.worker_batch_process > 1024 {
            return Err(Error::Config(format!(
                "worker_batch_process must be in 1..=1024, got {}",
                self.worker_batch_process
            )));
        }
        Ok(())
    }

    /// Receiver buffer and datagram pool buffer size: payload plus headroom.
    pub(crate) fn datagram_bsize(&self) -> usize {
        self.max_payload + 48
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        TcpConfig::default().validate().unwrap();
        UdpConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unaligned_ring_size() {
        let cfg = TcpConfig {
            read_bsize: 1000,
            ..TcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_retained_below_slab_count() {
        let cfg = TcpConfig {
            pool_slab_count: 32,
            pool_min_retained: 16,
            ..TcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_batch_submit_above_queue() {
        let cfg = TcpConfig {
            worker_queue_length: 4,
            worker_batch_submit: 8,
            ..TcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_ratio_bounds() {
        for ratio in [0.0, 1.0, 1.5] {
            let cfg = TcpConfig {
                worker_thread_ratio: ratio,
                ..TcpConfig::default()
            };
            assert!(cfg.validate().is_err(), "ratio {ratio} should be rejected");
        }
    }

    #[test]
    fn rejects_udp_payload_bounds() {
        for payload in [100, 1451, 65508] {
            let cfg = UdpConfig {
                max_payload: payload,
                ..UdpConfig::default()
            };
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn interest_bits() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READ.is_writable());
        assert!(!Interest::WRITE.is_readable());
    }
}
