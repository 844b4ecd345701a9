//! Process-scoped context for the deferred path.
//!
//! `init_process` builds everything once: the channel, the resume
//! handler, and the read end's registration with the reactor. It returns
//! a `DeferContext` that content handlers use to push requests onto
//! worker threads. Nothing lives in statics; whoever owns the context owns
//! the write end.

use crate::resume::ResumeHandler;

use handoff_core::config::HandoffConfig;
use handoff_core::error::{HandoffError, Result};
use handoff_core::handle::RequestHandle;
use handoff_core::host::{HandlerStatus, RequestHost, Respond};
use handoff_core::mux::{Interest, Readiness, Registrar, Token};
use handoff_core::sink::ChannelHealth;
use handoff_core::worker::{SpawnError, TaskSpawner, WorkerTask};
use handoff_module::{channel, WriteEnd};

use std::fmt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// A deferral that did not happen. The caller still owns the request
/// and should answer it synchronously.
pub struct Rejected {
    pub handle: RequestHandle,
    pub error: HandoffError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("handle", &self.handle.value())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferral of {} rejected: {}", self.handle.value(), self.error)
    }
}

pub struct DeferContext<S: TaskSpawner> {
    sink: Arc<WriteEnd>,
    spawner: S,
    health: ChannelHealth,
    token: Token,
    drain_timeout: Duration,
}

impl<S: TaskSpawner> fmt::Debug for DeferContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferContext")
            .field("token", &self.token)
            .field("degraded", &self.health.is_degraded())
            .field("outstanding", &self.spawner.outstanding())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: TaskSpawner> DeferContext<S> {
    /// Suspend `handle` in the host and run `work` on a worker thread.
    ///
    /// On success the handler must report `HandlerStatus::Deferred` and
    /// leave the request alone. On refusal the request is active again and
    /// the handle comes back inside `Rejected`.
    pub fn defer<H, F>(
        &self,
        host: &mut H,
        handle: RequestHandle,
        work: F,
    ) -> std::result::Result<HandlerStatus, Rejected>
    where
        H: RequestHost + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        if self.health.is_degraded() {
            tracing::warn!(handle = %handle.value(), "channel degraded, not deferring");
            return Err(Rejected { handle, error: HandoffError::Unavailable });
        }
        if let Err(e) = host.suspend(&handle) {
            return Err(Rejected { handle, error: HandoffError::Host(e) });
        }

        let task = WorkerTask::new(handle, Box::new(work), self.sink.clone(), self.health.clone());
        match self.spawner.spawn(task) {
            Ok(()) => Ok(HandlerStatus::Deferred),
            Err(SpawnError { task, reason }) => {
                let value = task.into_handle().into_raw();
                tracing::warn!(handle = %value, reason, "worker spawn rejected");
                // Undo the suspend so the caller can finish it inline.
                let handle = host
                    .reclaim(value)
                    .unwrap_or_else(|| RequestHandle::from_raw(value));
                Err(Rejected { handle, error: HandoffError::SpawnRejected(reason) })
            }
        }
    }

    pub fn is_available(&self) -> bool {
        !self.health.is_degraded()
    }

    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    /// Workers spawned and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.spawner.outstanding()
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Reactor token of the read end.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Stop taking work and wait up to the configured drain timeout.
    /// Returns how many workers are still running.
    ///
    /// Call this while the read end is still registered so handles from
    /// the last workers land on a live channel; `exit_process` drains again
    /// and reports whatever is left.
    pub fn drain(&self) -> usize {
        self.spawner.drain(self.drain_timeout)
    }

    /// Shutdown hook. Drains like `drain` and returns how many workers
    /// were still running; their requests are orphaned.
    pub fn exit_process(self) -> usize {
        let remaining = self.drain();
        if remaining > 0 {
            tracing::error!(
                remaining,
                timeout = ?self.drain_timeout,
                "workers still running at exit, their requests are orphaned"
            );
        } else {
            tracing::info!("deferred path drained");
        }
        remaining
    }
}

/// Init hook. Creates the channel and registers its read end with `mux`.
///
/// Any error here is fatal: the process must not serve deferred requests
/// without the path in place.
pub fn init_process<M, H, R, S>(
    mux: &mut M,
    host: H,
    responder: R,
    spawner: S,
    config: &HandoffConfig,
) -> Result<DeferContext<S>>
where
    M: Registrar + ?Sized,
    H: RequestHost + 'static,
    R: Respond + 'static,
    S: TaskSpawner,
{
    config.validate()?;

    let (write_end, read_end) = channel(config.write_stall_timeout)?;
    let fd = read_end.as_raw_fd();
    let health = ChannelHealth::new();
    let mut handler = ResumeHandler::new(read_end, host, responder, health.clone());

    let token = mux
        .register(
            fd,
            Interest::READABLE,
            config.trigger,
            Box::new(move |reg: &mut dyn Registrar, token: Token, _: Readiness| {
                if let Err(e) = handler.on_readable() {
                    tracing::debug!(finalized = e.report.finalized, "last drain pass before channel loss");
                    // Read side is dead; stop watching it.
                    if let Err(e) = reg.deregister(token) {
                        tracing::warn!(error = %e, "channel deregister failed");
                    }
                }
            }),
        )
        .map_err(|e| {
            tracing::error!(fd, error = %e, "channel registration failed");
            HandoffError::from(e)
        })?;

    tracing::info!(fd, token = token.0, trigger = ?config.trigger, "deferred completion ready");

    Ok(DeferContext {
        sink: Arc::new(write_end),
        spawner,
        health,
        token,
        drain_timeout: config.drain_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_core::host::{Response, StaticResponse};
    use handoff_core::mux::Multiplexer;
    use handoff_module::{EventLoop, RequestTable, ThreadPerTask};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ok() -> StaticResponse {
        StaticResponse(Response::text(200, "ok"))
    }

    #[test]
    fn init_registers_one_source() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::new()));
        let ctx = init_process(&mut ev, table, ok(), ThreadPerTask::new(0), &HandoffConfig::default())
            .unwrap();
        assert_eq!(ev.registration_count(), 1);
        assert!(ctx.is_available());
        assert_eq!(ctx.exit_process(), 0);
    }

    #[test]
    fn invalid_config_is_fatal() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::new()));
        let config = HandoffConfig::default().max_events(0);
        let err = init_process(&mut ev, table, ok(), ThreadPerTask::new(0), &config).unwrap_err();
        assert!(matches!(err, HandoffError::Config(_)));
        assert_eq!(ev.registration_count(), 0);
    }

    #[test]
    fn context_debug_names_its_state() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::new()));
        let ctx = init_process(&mut ev, table, ok(), ThreadPerTask::new(0), &HandoffConfig::default())
            .unwrap();
        let text = format!("{:?}", ctx);
        assert!(text.starts_with("DeferContext"));
        assert!(text.contains("degraded: false"));
        assert_eq!(ctx.exit_process(), 0);
    }

    #[test]
    fn drain_with_loop_alive_delivers_last_workers() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::new()));
        let ctx = init_process(&mut ev, table.clone(), ok(), ThreadPerTask::new(0), &HandoffConfig::default())
            .unwrap();
        let handle = table.borrow_mut().admit(());
        ctx.defer(&mut table.clone(), handle, || std::thread::sleep(Duration::from_millis(30)))
            .unwrap();

        assert_eq!(ctx.drain(), 0);
        assert!(ctx.is_available());
        // Drained spawners refuse new work.
        let late = table.borrow_mut().admit(());
        assert!(ctx.defer(&mut table.clone(), late, || {}).is_err());

        ev.run_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(table.borrow().deferred(), 0);
        assert_eq!(ctx.exit_process(), 0);
    }

    #[test]
    fn degraded_context_hands_handle_back() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::new()));
        let ctx = init_process(&mut ev, table.clone(), ok(), ThreadPerTask::new(0), &HandoffConfig::default())
            .unwrap();
        ctx.health().degrade();

        let handle = table.borrow_mut().admit(());
        let value = handle.value();
        let rejected = ctx.defer(&mut table.clone(), handle, || {}).unwrap_err();
        assert_eq!(rejected.handle.value(), value);
        assert!(matches!(rejected.error, HandoffError::Unavailable));
        assert!(!table.borrow().is_deferred(value));
    }

    #[test]
    fn spawn_rejection_reactivates_request() {
        let mut ev = EventLoop::new(16, 16).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::<()>::with_log(8)));
        let spawner = ThreadPerTask::new(0);
        spawner.registry().close();
        let ctx = init_process(&mut ev, table.clone(), ok(), spawner, &HandoffConfig::default())
            .unwrap();

        let handle = table.borrow_mut().admit(());
        let value = handle.value();
        let mut host = table.clone();
        let rejected = ctx.defer(&mut host, handle, || {}).unwrap_err();
        assert!(matches!(rejected.error, HandoffError::SpawnRejected(_)));
        assert!(!table.borrow().is_deferred(value));

        // Caller finishes it inline.
        host.finalize(rejected.handle, Response::text(503, "busy")).unwrap();
        assert_eq!(table.borrow_mut().take_finalized()[0].response.status, 503);
    }
}
