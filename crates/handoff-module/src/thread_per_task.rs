//! `ThreadPerTask`: default `TaskSpawner` implementation.
//!
//! Each deferred request gets its own detached, named OS thread. Nothing
//! joins it; the shared `TaskRegistry` is the only record that it exists.
//! An optional cap bounds how many may run at once.

use crate::registry::{run_tracked, TaskRegistry};

use handoff_core::worker::{SpawnError, TaskSpawner, WorkerTask};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub struct ThreadPerTask {
    registry: Arc<TaskRegistry>,
    /// 0 = unlimited.
    cap: usize,
    next_id: AtomicU64,
}

impl ThreadPerTask {
    pub fn new(cap: usize) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new()),
            cap,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}

impl Default for ThreadPerTask {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TaskSpawner for ThreadPerTask {
    fn spawn(&self, task: WorkerTask) -> Result<(), SpawnError> {
        if let Err(reason) = self.registry.try_begin(self.cap) {
            return Err(SpawnError { task, reason });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // thread::Builder::spawn drops the closure on failure; park the
        // task where we can get it back.
        let cell = Arc::new(Mutex::new(Some(task)));
        let theirs = Arc::clone(&cell);
        let registry = Arc::clone(&self.registry);

        let spawned = thread::Builder::new()
            .name(format!("handoff-worker-{}", id))
            .spawn(move || {
                let task = theirs.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(task) = task {
                    run_tracked(&registry, task);
                }
            });

        match spawned {
            Ok(_detached) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "worker thread spawn failed");
                self.registry.cancel_begin();
                let task = cell.lock().unwrap_or_else(PoisonError::into_inner).take();
                match task {
                    Some(task) => Err(SpawnError { task, reason: "thread spawn failed" }),
                    None => Ok(()),
                }
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.registry.outstanding()
    }

    fn drain(&self, timeout: Duration) -> usize {
        self.registry.close();
        self.registry.wait_idle(timeout)
    }
}
