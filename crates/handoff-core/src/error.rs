//! Handoff error types.
//!
//! Three families, matching how far the damage reaches:
//! setup errors (fatal to process init), transport errors (the deferred
//! path is dead for this process), and per-request errors (one request
//! is refused or discarded, everything else keeps running).

use std::fmt;
use std::io;

/// Failure writing a frame into the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Read end is gone (EPIPE).
    Closed,
    /// Pipe stayed full past the stall timeout.
    Stalled,
    /// An earlier frame was cut short; the stream is misaligned.
    Torn,
    /// Any other OS error.
    Io(i32),
}

/// Failure reading frames off the channel. Would-block is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Every write end is gone and no partial frame was pending.
    Closed,
    /// EOF arrived in the middle of a frame.
    Truncated(usize),
    /// Any other OS error.
    Io(i32),
}

/// The multiplexer refused a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationError {
    AlreadyRegistered(i32),
    /// Registration table is at `max_registrations`.
    Capacity(usize),
    /// Token does not name a live registration.
    UnknownToken(usize),
    Os(i32),
}

#[derive(Debug)]
pub enum HandoffError {
    /// pipe2() failed (descriptor exhaustion, usually).
    ChannelCreation(i32),
    Registration(RegistrationError),
    Write(WriteError),
    Read(ReadError),
    /// The channel errored earlier; deferral is off for this process.
    Unavailable,
    /// Worker spawner refused the task.
    SpawnRejected(&'static str),
    /// Host refused to suspend the request.
    Host(crate::host::HostError),
    /// Bad configuration value.
    Config(&'static str),
    Os(i32),
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

impl WriteError {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(errno_of(err)),
        }
    }
}

impl ReadError {
    pub fn from_io(err: &io::Error) -> Self {
        Self::Io(errno_of(err))
    }
}

impl RegistrationError {
    pub fn from_io(err: &io::Error, fd: i32) -> Self {
        match err.kind() {
            io::ErrorKind::AlreadyExists => Self::AlreadyRegistered(fd),
            _ => Self::Os(errno_of(err)),
        }
    }
}

impl HandoffError {
    pub fn os(err: &io::Error) -> Self {
        Self::Os(errno_of(err))
    }

    /// True for errors that take the whole deferred path down.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Read(_) | Self::Unavailable)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Stalled => write!(f, "channel full past stall timeout"),
            Self::Torn => write!(f, "channel stream torn by a partial frame"),
            Self::Io(e) => write!(f, "channel write: errno {}", e),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Truncated(n) => write!(f, "channel closed mid-frame ({} bytes pending)", n),
            Self::Io(e) => write!(f, "channel read: errno {}", e),
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered(fd) => write!(f, "fd {} already registered", fd),
            Self::Capacity(max) => write!(f, "registration table full ({})", max),
            Self::UnknownToken(t) => write!(f, "unknown token {}", t),
            Self::Os(e) => write!(f, "multiplexer: errno {}", e),
        }
    }
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelCreation(e) => write!(f, "channel creation failed: errno {}", e),
            Self::Registration(e) => write!(f, "registration failed: {}", e),
            Self::Write(e) => write!(f, "{}", e),
            Self::Read(e) => write!(f, "{}", e),
            Self::Unavailable => write!(f, "deferred completion unavailable"),
            Self::SpawnRejected(why) => write!(f, "worker spawn rejected: {}", why),
            Self::Host(e) => write!(f, "host: {}", e),
            Self::Config(msg) => write!(f, "config: {}", msg),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for WriteError {}
impl std::error::Error for ReadError {}
impl std::error::Error for RegistrationError {}
impl std::error::Error for HandoffError {}

impl From<WriteError> for HandoffError {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<ReadError> for HandoffError {
    fn from(e: ReadError) -> Self {
        Self::Read(e)
    }
}

impl From<RegistrationError> for HandoffError {
    fn from(e: RegistrationError) -> Self {
        Self::Registration(e)
    }
}

impl From<crate::host::HostError> for HandoffError {
    fn from(e: crate::host::HostError) -> Self {
        Self::Host(e)
    }
}

pub type Result<T> = std::result::Result<T, HandoffError>;
