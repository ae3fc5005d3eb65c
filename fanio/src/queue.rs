//! Worker dispatch.
//!
//! Each I/O loop stages ready tasks into a small per-loop buffer and submits
//! them to its bounded MPMC queue; workers drain the queues on long-lived,
//! best-effort-pinned threads. A full queue never blocks an I/O loop: the
//! affected connections are rearmed so the kernel re-delivers their
//! readiness once the workers catch up.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::debug;

use crate::connection::Conn;

/// Which callback a staged task should invoke.
pub(crate) enum TaskKind {
    Read,
    Write,
}

pub(crate) struct Task<C> {
    pub conn: Arc<Conn<C>>,
    pub kind: TaskKind,
}

/// Per-loop staging buffer in front of the bounded task queue.
///
/// With a capacity of one every push submits immediately; otherwise tasks
/// accumulate until the buffer fills or the I/O loop finishes a poll batch
/// and flushes unconditionally.
pub(crate) struct Stage<C> {
    tx: Sender<Task<C>>,
    buf: Vec<Task<C>>,
    cap: usize,
}

impl<C> Stage<C> {
    pub fn new(tx: Sender<Task<C>>, cap: usize) -> Self {
        Stage {
            tx,
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, task: Task<C>) {
        if self.cap <= 1 {
            self.submit(task);
            return;
        }
        self.buf.push(task);
        if self.buf.len() >= self.cap {
            self.flush();
        }
    }

    /// Submit everything staged. On queue saturation the unsubmitted tail is
    /// rearmed instead of dropped or blocked on.
    pub fn flush(&mut self) {
        let mut rearm_rest = false;
        let mut drop_rest = false;
        for task in self.buf.drain(..) {
            if drop_rest {
                continue;
            }
            if rearm_rest {
                rearm_or_close(&task.conn);
                continue;
            }
            match self.tx.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) => {
                    debug!("worker queue full, deferring to kernel readiness");
                    rearm_rest = true;
                    rearm_or_close(&task.conn);
                }
                Err(TrySendError::Disconnected(_)) => {
                    // Workers are gone; shutdown is in progress.
                    drop_rest = true;
                }
            }
        }
    }

    fn submit(&mut self, task: Task<C>) {
        if let Err(TrySendError::Full(task)) = self.tx.try_send(task) {
            debug!("worker queue full, deferring to kernel readiness");
            rearm_or_close(&task.conn);
        }
    }
}

/// The backpressure path: repost the event to the kernel. A failed rearm is
/// fatal for the connection.
fn rearm_or_close<C>(conn: &Conn<C>) {
    if !conn.renable_events() {
        conn.close();
    }
}

/// A queue occupancy below this is not worth stealing from.
const STEAL_THRESHOLD: usize = 4;

/// How long a worker blocks on its own queue before scanning peers.
const IDLE_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Spawn `count` worker threads over the given queues.
///
/// Queue `j` is assigned to worker `j % count`, so every queue has a
/// dedicated consumer even when queues outnumber workers; a worker whose
/// assignment would be empty falls back to servicing all queues. Workers
/// may additionally steal single tasks from busy unassigned queues while
/// idle, and exit when every queue sender has been dropped.
pub(crate) fn spawn_workers<T, F>(
    name_prefix: &str,
    count: usize,
    batch_process: usize,
    rxs: &[Receiver<T>],
    run: F,
) -> io::Result<WorkerPool>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let run = Arc::new(run);
    let mut handles = Vec::with_capacity(count);

    for worker_id in 0..count {
        let mut assigned: Vec<Receiver<T>> = rxs
            .iter()
            .enumerate()
            .filter(|(j, _)| j % count == worker_id)
            .map(|(_, rx)| rx.clone())
            .collect();
        if assigned.is_empty() {
            assigned = rxs.to_vec();
        }
        let peers: Vec<Receiver<T>> = rxs
            .iter()
            .enumerate()
            .filter(|(j, _)| j % count != worker_id)
            .map(|(_, rx)| rx.clone())
            .collect();
        let run = Arc::clone(&run);

        let handle = thread::Builder::new()
            .name(format!("{name_prefix}-{worker_id}"))
            .spawn(move || {
                if let Err(e) = set_cpu_affinity(worker_id) {
                    debug!("worker {worker_id}: cpu pinning unavailable: {e}");
                }
                worker_loop(assigned, peers, batch_process, &*run);
            })?;

        handles.push(handle);
    }

    Ok(WorkerPool { handles })
}

fn worker_loop<T, F: Fn(T)>(
    assigned: Vec<Receiver<T>>,
    peers: Vec<Receiver<T>>,
    batch_process: usize,
    run: &F,
) {
    let mut cursor = 0usize;
    loop {
        // Fast pass: drain whatever is immediately available on any
        // assigned queue, up to the batch limit per queue.
        let mut ran = false;
        let mut disconnected = 0;
        for rx in &assigned {
            match rx.try_recv() {
                Ok(task) => {
                    run(task);
                    ran = true;
                    for _ in 1..batch_process {
                        match rx.try_recv() {
                            Ok(task) => run(task),
                            Err(_) => break,
                        }
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => disconnected += 1,
            }
        }
        if disconnected == assigned.len() {
            return;
        }
        if ran {
            continue;
        }

        // Idle: block on one assigned queue, rotating so each of them gets
        // a sleeping consumer over time.
        cursor = (cursor + 1) % assigned.len();
        match assigned[cursor].recv_timeout(IDLE_WAIT) {
            Ok(task) => run(task),
            Err(RecvTimeoutError::Timeout) => {
                // Bounded steal scan, one task at a time, gated on occupancy
                // so an almost-empty peer queue is left alone.
                for peer in &peers {
                    if peer.len() >= STEAL_THRESHOLD {
                        if let Ok(task) = peer.try_recv() {
                            run(task);
                            break;
                        }
                    }
                }
            }
            // Other assigned queues may still be live; the next fast pass
            // re-checks all of them.
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }
}

/// Best-effort pinning of the current thread to one CPU.
fn set_cpu_affinity(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % num_cpus(), &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn num_cpus() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn workers_drain_queue_and_exit_on_disconnect() {
        let (tx, rx) = bounded::<usize>(64);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let pool = spawn_workers("test-worker", 2, 4, &[rx], move |n| {
            c.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();

        for i in 1..=10 {
            tx.send(i).unwrap();
        }
        drop(tx);
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 55);
    }

    #[test]
    fn few_workers_service_every_queue() {
        let mut txs = Vec::new();
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = bounded::<usize>(16);
            txs.push(tx);
            rxs.push(rx);
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        // One worker, three queues: its assignment must cover all of them,
        // not just queue zero.
        let pool = spawn_workers("spread-worker", 1, 4, &rxs, move |n| {
            c.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();

        for tx in &txs {
            for _ in 0..5 {
                tx.send(1).unwrap();
            }
        }
        drop(txs);
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn stealing_respects_occupancy_threshold() {
        let (tx_a, rx_a) = bounded::<usize>(64);
        let (tx_b, rx_b) = bounded::<usize>(64);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        // A worker assigned only queue A, with B as a steal target. B holds
        // 8 tasks; one is stolen per idle scan until B's occupancy drops
        // below the threshold, so exactly 8 - (STEAL_THRESHOLD - 1) run.
        let worker = std::thread::spawn(move || {
            let run = move |_n: usize| {
                c.fetch_add(1, Ordering::SeqCst);
            };
            worker_loop(vec![rx_a], vec![rx_b], 1, &run);
        });

        for _ in 0..8 {
            tx_b.send(1).unwrap();
        }

        let expected = 8 - (STEAL_THRESHOLD - 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < expected {
            assert!(std::time::Instant::now() < deadline, "steal scan stalled");
            std::thread::sleep(Duration::from_millis(10));
        }

        drop(tx_a);
        drop(tx_b);
        worker.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
}
