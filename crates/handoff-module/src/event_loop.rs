//! `EventLoop`: default `Multiplexer` implementation.
//!
//! Single-threaded. Owns a registration table (slab with free list,
//! token = slot index) and a platform `Selector`. `run_once()` waits once
//! and runs each ready callback on the calling thread.
//!
//! Callbacks get `&mut dyn Registrar` so they can add connections or
//! remove themselves. The callback is taken out of its slot while it
//! runs and put back afterwards only if the slot still holds the same
//! registration.

use crate::selector::{PollerSelector, Selector};

use handoff_core::config::HandoffConfig;
use handoff_core::error::RegistrationError;
use handoff_core::mux::{Callback, Interest, Multiplexer, Readiness, Registrar, Token, Trigger};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

struct Registration {
    fd: RawFd,
    interest: Interest,
    trigger: Trigger,
    /// `None` while the callback is running.
    callback: Option<Callback>,
}

pub struct EventLoop<S: Selector = PollerSelector> {
    selector: S,
    slots: Vec<Option<Registration>>,
    free: Vec<usize>,
    by_fd: HashMap<RawFd, usize>,
    max_registrations: usize,
    events: Vec<(Token, Readiness)>,
}

impl EventLoop<PollerSelector> {
    pub fn new(max_events: usize, max_registrations: usize) -> io::Result<Self> {
        Ok(Self::with_selector(PollerSelector::new(max_events)?, max_registrations))
    }

    pub fn from_config(config: &HandoffConfig) -> io::Result<Self> {
        Self::new(config.max_events, config.max_registrations)
    }
}

impl<S: Selector> EventLoop<S> {
    pub fn with_selector(selector: S, max_registrations: usize) -> Self {
        Self {
            selector,
            slots: Vec::new(),
            free: Vec::new(),
            by_fd: HashMap::new(),
            max_registrations,
            events: Vec::new(),
        }
    }

    /// Run `run_once` until `done()` says stop or a wait fails.
    pub fn run_until(
        &mut self,
        mut done: impl FnMut() -> bool,
        tick: Option<Duration>,
    ) -> io::Result<()> {
        while !done() {
            self.run_once(tick)?;
        }
        Ok(())
    }

    fn alloc(&mut self, reg: Registration) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(reg);
                idx
            }
            None => {
                self.slots.push(Some(reg));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<Registration> {
        let reg = self.slots.get_mut(idx)?.take()?;
        self.by_fd.remove(&reg.fd);
        self.free.push(idx);
        Some(reg)
    }

    /// Put a callback back after it ran, re-arming one-shot watches.
    fn restore(&mut self, token: Token, fd: RawFd, callback: Callback) {
        let Some(reg) = self.slots.get_mut(token.0).and_then(Option::as_mut) else {
            return;
        };
        // Slot reused by a new registration while the callback ran.
        if reg.fd != fd || reg.callback.is_some() {
            return;
        }
        reg.callback = Some(callback);
        if reg.trigger == Trigger::OneShot {
            if let Err(e) = self.selector.modify(fd, token, reg.interest, Trigger::OneShot) {
                tracing::warn!(fd, token = token.0, error = %e, "one-shot re-arm failed");
            }
        }
    }
}

impl<S: Selector> Registrar for EventLoop<S> {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        trigger: Trigger,
        callback: Callback,
    ) -> Result<Token, RegistrationError> {
        if self.by_fd.contains_key(&fd) {
            return Err(RegistrationError::AlreadyRegistered(fd));
        }
        if self.by_fd.len() >= self.max_registrations {
            return Err(RegistrationError::Capacity(self.max_registrations));
        }

        let idx = self.alloc(Registration {
            fd,
            interest,
            trigger,
            callback: Some(callback),
        });
        if let Err(e) = self.selector.add(fd, Token(idx), interest, trigger) {
            self.slots[idx] = None;
            self.free.push(idx);
            return Err(RegistrationError::from_io(&e, fd));
        }
        self.by_fd.insert(fd, idx);
        tracing::trace!(fd, token = idx, ?trigger, "registered");
        Ok(Token(idx))
    }

    fn reregister(&mut self, token: Token, interest: Interest) -> Result<(), RegistrationError> {
        let reg = self
            .slots
            .get_mut(token.0)
            .and_then(Option::as_mut)
            .ok_or(RegistrationError::UnknownToken(token.0))?;
        self.selector
            .modify(reg.fd, token, interest, reg.trigger)
            .map_err(|e| RegistrationError::from_io(&e, reg.fd))?;
        reg.interest = interest;
        Ok(())
    }

    fn deregister(&mut self, token: Token) -> Result<(), RegistrationError> {
        let fd = self
            .slots
            .get(token.0)
            .and_then(Option::as_ref)
            .map(|reg| reg.fd)
            .ok_or(RegistrationError::UnknownToken(token.0))?;
        if let Err(e) = self.selector.delete(fd) {
            // Already closed or never made it into the kernel set: nothing
            // left to watch. Anything else keeps the slot so its token is
            // not handed to a new descriptor while the old watch lives.
            match e.raw_os_error() {
                Some(libc::EBADF) | Some(libc::ENOENT) => {}
                _ => return Err(RegistrationError::from_io(&e, fd)),
            }
        }
        self.release(token.0);
        tracing::trace!(fd, token = token.0, "deregistered");
        Ok(())
    }
}

impl<S: Selector> Multiplexer for EventLoop<S> {
    fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let waited = self.selector.select(&mut events, timeout);
        if let Err(e) = waited {
            self.events = events;
            return Err(e);
        }

        let mut ran = 0;
        for &(token, readiness) in &events {
            let Some(reg) = self.slots.get_mut(token.0).and_then(Option::as_mut) else {
                // Deregistered earlier in this batch.
                continue;
            };
            let Some(mut callback) = reg.callback.take() else {
                continue;
            };
            let fd = reg.fd;
            callback(self, token, readiness);
            self.restore(token, fd, callback);
            ran += 1;
        }

        self.events = events;
        Ok(ran)
    }

    fn registration_count(&self) -> usize {
        self.by_fd.len()
    }
}
