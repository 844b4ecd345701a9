//! `polling::Poller` selector.
//!
//! epoll on Linux, kqueue on the BSDs and macOS, event ports on illumos.
//! Token goes in the event key. `Trigger` maps onto `PollMode` one to one;
//! a backend without edge support serves `Edge` as level, which only costs
//! extra wakeups since callbacks drain anyway.

use super::Selector;

use handoff_core::mux::{Interest, Readiness, Token, Trigger};

use polling::{Event, Events, PollMode, Poller};

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollerSelector {
    poller: Poller,
    events: Events,
}

impl PollerSelector {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let cap = NonZeroUsize::new(max_events).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            poller: Poller::new()?,
            events: Events::with_capacity(cap),
        })
    }

    fn event(token: Token, interest: Interest) -> Event {
        match (interest.readable, interest.writable) {
            (true, true) => Event::all(token.0),
            (true, false) => Event::readable(token.0),
            (false, true) => Event::writable(token.0),
            (false, false) => Event::none(token.0),
        }
    }

    fn mode(&self, trigger: Trigger) -> PollMode {
        match trigger {
            Trigger::Level => PollMode::Level,
            Trigger::Edge if self.poller.supports_edge() => PollMode::Edge,
            Trigger::Edge => PollMode::Level,
            Trigger::OneShot => PollMode::Oneshot,
        }
    }
}

/// Borrow a descriptor the event loop has registered.
///
/// Safety: callers only pass descriptors that were added and not yet
/// deleted, which the registrant keeps open for that whole span.
unsafe fn registered(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

impl Selector for PollerSelector {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest, trigger: Trigger) -> io::Result<()> {
        let mode = self.mode(trigger);
        // Safety: the registrant keeps fd open until `delete`.
        unsafe { self.poller.add_with_mode(fd, Self::event(token, interest), mode) }
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest, trigger: Trigger) -> io::Result<()> {
        let mode = self.mode(trigger);
        let fd = unsafe { registered(fd) };
        self.poller.modify_with_mode(fd, Self::event(token, interest), mode)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let fd = unsafe { registered(fd) };
        self.poller.delete(fd)
    }

    fn select(&mut self, events: &mut Vec<(Token, Readiness)>, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for ev in self.events.iter() {
            events.push((
                Token(ev.key),
                Readiness {
                    readable: ev.readable,
                    writable: ev.writable,
                    hangup: ev.is_interrupt(),
                    error: ev.is_err().unwrap_or(false),
                },
            ));
        }
        Ok(())
    }
}
