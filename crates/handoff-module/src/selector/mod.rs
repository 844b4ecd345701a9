//! Readiness selectors
//!
//! The OS-level half of the event loop: add/modify/delete descriptors and
//! wait for readiness. `EventLoop` owns the callbacks; a selector only
//! deals in tokens.

use handoff_core::mux::{Interest, Readiness, Token, Trigger};

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Platform readiness primitive.
pub trait Selector {
    /// Start watching `fd`. An fd already present is `AlreadyExists`.
    ///
    /// The caller keeps `fd` open until it has been deleted again.
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest, trigger: Trigger) -> io::Result<()>;

    /// Change interest, and re-arm a one-shot registration.
    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest, trigger: Trigger) -> io::Result<()>;

    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` and append ready `(token, readiness)` pairs.
    /// An interrupted wait returns `Ok` with nothing appended.
    fn select(&mut self, events: &mut Vec<(Token, Readiness)>, timeout: Option<Duration>) -> io::Result<()>;
}

mod poller;
pub use poller::PollerSelector;
