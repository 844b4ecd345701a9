//! Worker task abstraction.
//!
//! A `WorkerTask` is one deferred request: the handle, the blocking work,
//! and the sink to write the handle into afterwards. A `TaskSpawner`
//! decides which thread runs it.
//!
//! # Implementors
//!
//! - `ThreadPerTask` (default): one detached OS thread per task.
//! - `FixedPool`: N threads pulling from a bounded lock-free queue.

use crate::handle::RequestHandle;
use crate::sink::{ChannelHealth, HandleSink};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Work = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerTask {
    handle: RequestHandle,
    work: Work,
    sink: Arc<dyn HandleSink>,
    health: ChannelHealth,
}

impl WorkerTask {
    pub fn new(
        handle: RequestHandle,
        work: Work,
        sink: Arc<dyn HandleSink>,
        health: ChannelHealth,
    ) -> Self {
        Self { handle, work, sink, health }
    }

    /// Handle this task will deliver.
    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    /// Give up on running the task and take the handle back.
    pub fn into_handle(self) -> RequestHandle {
        self.handle
    }

    /// Run the work, then write the handle exactly once.
    ///
    /// A failed write orphans the request: the host keeps it suspended
    /// and nothing will ever finish it. Logged, not retried.
    pub fn run(self) {
        let Self { handle, work, sink, health } = self;
        let value = handle.value();

        work();

        match sink.write_handle(handle) {
            Ok(()) => tracing::debug!(handle = %value, "handle delivered"),
            Err(e) => {
                tracing::error!(handle = %value, error = %e, "handle write failed, request orphaned");
                if health.degrade() {
                    tracing::error!("deferred completion degraded by write failure");
                }
            }
        }
    }
}

impl fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("handle", &self.handle.value())
            .finish_non_exhaustive()
    }
}

/// A spawn that was refused. Carries the task back so the caller keeps
/// ownership of the handle.
pub struct SpawnError {
    pub task: WorkerTask,
    pub reason: &'static str,
}

impl fmt::Debug for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("handle", &self.task.handle().value())
            .field("reason", &self.reason)
            .finish()
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spawn rejected for {}: {}", self.task.handle().value(), self.reason)
    }
}

/// Runs worker tasks off the reactor thread.
///
/// **Contract:**
/// - `spawn()` never blocks the reactor. A refusal returns the task.
/// - Tasks may block for as long as they like.
/// - No cancellation: a spawned task always runs to completion.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: WorkerTask) -> Result<(), SpawnError>;

    /// Tasks spawned but not yet finished.
    fn outstanding(&self) -> usize;

    /// Stop accepting tasks and wait up to `timeout` for running ones.
    /// Returns how many were still running at the deadline.
    fn drain(&self, timeout: Duration) -> usize;
}

impl<S: TaskSpawner + ?Sized> TaskSpawner for Box<S> {
    fn spawn(&self, task: WorkerTask) -> Result<(), SpawnError> {
        (**self).spawn(task)
    }

    fn outstanding(&self) -> usize {
        (**self).outstanding()
    }

    fn drain(&self, timeout: Duration) -> usize {
        (**self).drain(timeout)
    }
}
