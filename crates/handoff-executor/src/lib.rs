//! # handoff-executor: The resume path
//!
//! Ties the pieces together for one reactor process:
//!
//! ```text
//! reactor thread                          worker thread
//! ──────────────                          ─────────────
//! handler: ctx.defer(host, h, work) ──►   work()
//!   host.suspend(h)                       write_handle(h) ──┐
//!   return Deferred                                         │ pipe
//! ...                                                       │
//! mux: read end readable  ◄─────────────────────────────────┘
//!   ResumeHandler::on_readable()
//!     loop read_handle() until None
//!       host.reclaim(v) → respond → host.finalize(h, resp)
//! ```
//!
//! `init_process` creates and registers the channel once per process;
//! `DeferContext::exit_process` drains workers at shutdown.

pub mod context;
pub mod resume;

pub use context::{init_process, DeferContext, Rejected};
pub use resume::{ResumeError, ResumeHandler, ResumeReport};
