//! Outstanding-task bookkeeping shared by the spawners.
//!
//! Workers are fire-and-forget from the reactor's point of view, but the
//! process still wants to know how many are in flight and to wait for
//! them at shutdown. `TaskRegistry` counts them and lets `drain` sleep
//! on a condvar until the count reaches zero.

use handoff_core::worker::WorkerTask;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct TaskRegistry {
    outstanding: AtomicUsize,
    spawned: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    closed: AtomicBool,
    lock: Mutex<()>,
    idle: Condvar,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new task. Fails once closed, or when `cap` (non-zero)
    /// tasks are already outstanding.
    pub fn try_begin(&self, cap: usize) -> Result<(), &'static str> {
        if self.is_closed() {
            return Err("spawner shut down");
        }
        let mut cur = self.outstanding.load(Ordering::Relaxed);
        loop {
            if cap != 0 && cur >= cap {
                return Err("too many outstanding workers");
            }
            match self.outstanding.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Undo a `try_begin` whose task never started.
    pub fn cancel_begin(&self) {
        self.spawned.fetch_sub(1, Ordering::Relaxed);
        self.release();
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.release();
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.idle.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until nothing is outstanding or `timeout` passes.
    /// Returns the count still outstanding.
    pub fn wait_idle(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let n = self.outstanding();
            if n == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                return n;
            }
            guard = match self.idle.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Run a task on the current (worker) thread and count it finished, even
/// if its work panics. A panic means the handle is never written.
pub(crate) fn run_tracked(registry: &Arc<TaskRegistry>, task: WorkerTask) {
    let value = task.handle().value();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || task.run()));
    if outcome.is_err() {
        registry.panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!(handle = %value, "worker panicked, request orphaned");
    }
    registry.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cap_is_enforced() {
        let reg = TaskRegistry::new();
        reg.try_begin(2).unwrap();
        reg.try_begin(2).unwrap();
        assert!(reg.try_begin(2).is_err());
        reg.cancel_begin();
        reg.try_begin(2).unwrap();
        assert_eq!(reg.outstanding(), 2);
        assert_eq!(reg.spawned(), 2);
    }

    #[test]
    fn closed_refuses() {
        let reg = TaskRegistry::new();
        reg.close();
        assert_eq!(reg.try_begin(0), Err("spawner shut down"));
    }

    #[test]
    fn wait_idle_wakes_on_last_finish() {
        let reg = Arc::new(TaskRegistry::new());
        reg.try_begin(0).unwrap();
        let r2 = Arc::clone(&reg);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            r2.finish();
        });
        let start = Instant::now();
        assert_eq!(reg.wait_idle(Duration::from_secs(5)), 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(reg.completed(), 1);
        t.join().unwrap();
    }

    #[test]
    fn wait_idle_times_out() {
        let reg = TaskRegistry::new();
        reg.try_begin(0).unwrap();
        assert_eq!(reg.wait_idle(Duration::from_millis(20)), 1);
    }
}
