//! `FixedPool`: bounded `TaskSpawner` implementation.
//!
//! Spawns N OS threads at creation. Tasks go into a lock-free bounded
//! MPMC queue; an idle worker is unparked on every enqueue. A full queue
//! refuses the task (and hands it back) instead of blocking the reactor.
//!
//! No dynamic scaling. Simple, predictable, safe.

use crate::registry::{run_tracked, TaskRegistry};

use handoff_core::worker::{SpawnError, TaskSpawner, WorkerTask};

use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on how long an idle worker sleeps before re-checking.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Shared state between the reactor (producer) and workers.
struct PoolInner {
    queue: ArrayQueue<WorkerTask>,
    registry: Arc<TaskRegistry>,
    shutdown: AtomicBool,
    /// Round-robin cursor for unpark.
    next_wake: AtomicUsize,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    threads: Vec<thread::Thread>,
}

impl FixedPool {
    /// Create a pool with `n` workers (clamped to 1..=64) and a queue of
    /// `queue_depth` pending tasks.
    pub fn new(n: usize, queue_depth: usize) -> io::Result<Self> {
        let n = n.clamp(1, 64);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(queue_depth.max(1)),
            registry: Arc::new(TaskRegistry::new()),
            shutdown: AtomicBool::new(false),
            next_wake: AtomicUsize::new(0),
        });

        let mut threads = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner_clone = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("handoff-pool-{}", worker_id))
                .spawn(move || worker_loop(inner_clone));
            match spawned {
                Ok(handle) => threads.push(handle.thread().clone()),
                Err(e) => {
                    // Let the ones already started exit.
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for t in &threads {
                        t.unpark();
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = n, queue_depth, "worker pool started");
        Ok(FixedPool { inner, threads })
    }

    /// Default sizing: min(8, nproc/2), at least 2.
    pub fn auto_sized(queue_depth: usize) -> io::Result<Self> {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new((cpus / 2).clamp(2, 8), queue_depth)
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    fn wake_one(&self) {
        let i = self.inner.next_wake.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].unpark();
    }

    fn wake_all(&self) {
        for t in &self.threads {
            t.unpark();
        }
    }
}

impl TaskSpawner for FixedPool {
    fn spawn(&self, task: WorkerTask) -> Result<(), SpawnError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SpawnError { task, reason: "pool shut down" });
        }
        if let Err(reason) = self.inner.registry.try_begin(0) {
            return Err(SpawnError { task, reason });
        }
        match self.inner.queue.push(task) {
            Ok(()) => {
                self.wake_one();
                Ok(())
            }
            Err(task) => {
                self.inner.registry.cancel_begin();
                Err(SpawnError { task, reason: "worker queue full" })
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.inner.registry.outstanding()
    }

    /// Queued tasks still run; only new spawns are refused.
    fn drain(&self, timeout: Duration) -> usize {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.registry.close();
        self.wake_all();
        self.inner.registry.wait_idle(timeout)
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Workers exit once the queue is empty. Not joined: a worker may
        // be inside a long blocking call.
        self.wake_all();
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.queue.pop() {
            Some(task) => run_tracked(&inner.registry, task),
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(IDLE_PARK);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_core::error::WriteError;
    use handoff_core::handle::{HandleValue, RequestHandle};
    use handoff_core::sink::{ChannelHealth, HandleSink};
    use std::sync::{mpsc, Mutex};

    struct Forward(Mutex<mpsc::Sender<HandleValue>>);

    impl HandleSink for Forward {
        fn write_handle(&self, handle: RequestHandle) -> Result<(), WriteError> {
            let _ = self.0.lock().unwrap().send(handle.into_raw());
            Ok(())
        }
    }

    fn task(slot: u32, sink: &Arc<Forward>, work: impl FnOnce() + Send + 'static) -> WorkerTask {
        WorkerTask::new(
            RequestHandle::from_raw(HandleValue::new(slot, 0)),
            Box::new(work),
            sink.clone(),
            ChannelHealth::new(),
        )
    }

    #[test]
    fn runs_every_task() {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Forward(Mutex::new(tx)));
        let pool = FixedPool::new(3, 64).unwrap();
        assert_eq!(pool.workers(), 3);
        for i in 0..50 {
            pool.spawn(task(i, &sink, || {})).unwrap();
        }
        let mut got: Vec<u32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().slot())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
        assert_eq!(pool.drain(Duration::from_secs(5)), 0);
    }

    #[test]
    fn full_queue_rejects() {
        let (tx, _rx) = mpsc::channel();
        let sink = Arc::new(Forward(Mutex::new(tx)));
        let pool = FixedPool::new(1, 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Occupy the only worker...
        pool.spawn(task(0, &sink, move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // ...fill the queue...
        pool.spawn(task(1, &sink, || {})).unwrap();
        // ...and the next one bounces.
        let err = pool.spawn(task(2, &sink, || {})).unwrap_err();
        assert_eq!(err.reason, "worker queue full");
        assert_eq!(err.task.into_handle().value().slot(), 2);
        assert_eq!(pool.outstanding(), 2);

        gate_tx.send(()).unwrap();
        assert_eq!(pool.drain(Duration::from_secs(5)), 0);
    }

    #[test]
    fn drain_runs_queued_and_refuses_new() {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Forward(Mutex::new(tx)));
        let pool = FixedPool::new(1, 16).unwrap();
        for i in 0..4 {
            pool.spawn(task(i, &sink, || thread::sleep(Duration::from_millis(5))))
                .unwrap();
        }
        assert_eq!(pool.drain(Duration::from_secs(5)), 0);
        assert_eq!(rx.try_iter().count(), 4);
        assert!(pool.spawn(task(9, &sink, || {})).is_err());
    }
}
