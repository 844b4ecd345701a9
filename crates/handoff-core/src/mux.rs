//! Reactor event registration.
//!
//! A `Multiplexer` is the reactor's I/O wait: it watches raw descriptors
//! and invokes a callback on the reactor thread when one is ready.
//!
//! # Implementors
//!
//! - `EventLoop` (handoff-module): `polling::Poller`, so epoll on Linux
//!   and kqueue on the BSDs and macOS.

use crate::error::RegistrationError;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Registration identifier. Index into the multiplexer's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// Which directions to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Self = Self { readable: true, writable: false };
    pub const WRITABLE: Self = Self { readable: false, writable: true };
    pub const BOTH: Self = Self { readable: true, writable: true };
}

/// How readiness is reported.
///
/// - `Level`: reported on every wait while the condition holds.
/// - `Edge`: reported when the condition changes; the callback must drain.
/// - `OneShot`: reported once, then disarmed until the multiplexer
///   re-arms it after the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
    OneShot,
}

impl std::str::FromStr for Trigger {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "level" => Ok(Self::Level),
            "edge" => Ok(Self::Edge),
            "oneshot" | "one-shot" => Ok(Self::OneShot),
            _ => Err(()),
        }
    }
}

/// What the wait reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed (EPOLLHUP / POLLHUP).
    pub hangup: bool,
    /// EPOLLERR / POLLERR.
    pub error: bool,
}

/// Reactor-thread callback. Receives the registrar so it can register or
/// deregister sources (including itself) while running.
pub type Callback = Box<dyn FnMut(&mut dyn Registrar, Token, Readiness)>;

/// Add, change, and remove watched descriptors.
///
/// **Contract:**
/// - The caller keeps `fd` open until it deregisters it.
/// - One registration per descriptor.
pub trait Registrar {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        trigger: Trigger,
        callback: Callback,
    ) -> Result<Token, RegistrationError>;

    fn reregister(&mut self, token: Token, interest: Interest) -> Result<(), RegistrationError>;

    fn deregister(&mut self, token: Token) -> Result<(), RegistrationError>;
}

/// The reactor's wait-and-dispatch step.
pub trait Multiplexer: Registrar {
    /// Wait up to `timeout` (`None` = forever) and run the callback of
    /// every ready registration. Returns the number of callbacks run.
    ///
    /// `EINTR` counts as an empty wakeup, not an error.
    fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    fn registration_count(&self) -> usize;
}
