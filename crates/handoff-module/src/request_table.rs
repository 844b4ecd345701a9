//! `RequestTable`: in-memory `RequestHost`.
//!
//! Slab of request slots with a free list and a per-slot generation. A
//! `HandleValue` is `(slot, generation)`; retiring or cancelling a slot
//! bumps its generation, so anything still carrying the old value is
//! recognised as stale when it comes back.
//!
//! Lifecycle of one slot:
//!
//! ```text
//!   admit ──► Active ──suspend──► Deferred ──reclaim──► Active ──finalize──► (free)
//!                 └──────────────────────── cancel ─────────────────────────┘
//! ```
//!
//! Finalized responses are not retained unless the table was built with
//! `with_log(cap)`, which keeps the most recent `cap` of them.

use handoff_core::handle::{HandleValue, RequestHandle};
use handoff_core::host::{HostError, RequestHost, Response};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Deferred { since: Instant },
}

#[derive(Debug)]
struct Live<T> {
    payload: T,
    state: State,
    admitted_at: Instant,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    live: Option<Live<T>>,
}

/// One finalized request, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub handle: HandleValue,
    pub response: Response,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RequestTable<T = ()> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    deferred: usize,
    finalized: VecDeque<Finalized>,
    log_cap: usize,
}

impl<T> Default for RequestTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            deferred: 0,
            finalized: VecDeque::new(),
            log_cap: 0,
        }
    }
}

impl<T> RequestTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like `new`, but remember the last `cap` finalized requests for
    /// `take_finalized`.
    pub fn with_log(cap: usize) -> Self {
        Self {
            finalized: VecDeque::with_capacity(cap.min(1024)),
            log_cap: cap,
            ..Self::default()
        }
    }

    /// Start tracking a new request.
    pub fn admit(&mut self, payload: T) -> RequestHandle {
        let live = Live {
            payload,
            state: State::Active,
            admitted_at: Instant::now(),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].live = Some(live);
                idx
            }
            None => {
                self.slots.push(Slot { generation: 0, live: Some(live) });
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;
        let generation = self.slots[idx as usize].generation;
        RequestHandle::from_raw(HandleValue::new(idx, generation))
    }

    fn lookup(&self, value: HandleValue) -> Option<&Live<T>> {
        let slot = self.slots.get(value.slot() as usize)?;
        if slot.generation != value.generation() {
            return None;
        }
        slot.live.as_ref()
    }

    fn lookup_mut(&mut self, value: HandleValue) -> Option<&mut Live<T>> {
        let slot = self.slots.get_mut(value.slot() as usize)?;
        if slot.generation != value.generation() {
            return None;
        }
        slot.live.as_mut()
    }

    fn free_slot(&mut self, value: HandleValue) -> Option<Live<T>> {
        let slot = self.slots.get_mut(value.slot() as usize)?;
        if slot.generation != value.generation() {
            return None;
        }
        let live = slot.live.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(value.slot());
        self.live -= 1;
        if matches!(live.state, State::Deferred { .. }) {
            self.deferred -= 1;
        }
        Some(live)
    }

    pub fn payload(&self, value: HandleValue) -> Option<&T> {
        self.lookup(value).map(|l| &l.payload)
    }

    pub fn is_deferred(&self, value: HandleValue) -> bool {
        matches!(
            self.lookup(value).map(|l| l.state),
            Some(State::Deferred { .. })
        )
    }

    /// Retire an active request and hand back its payload and age.
    /// The caller sends the response itself.
    pub fn retire(&mut self, handle: RequestHandle) -> Result<(T, Duration), HostError> {
        let value = handle.into_raw();
        match self.lookup(value).map(|l| l.state) {
            None => return Err(HostError::Unknown(value)),
            Some(State::Deferred { .. }) => return Err(HostError::NotActive(value)),
            Some(State::Active) => {}
        }
        let live = self.free_slot(value).ok_or(HostError::Unknown(value))?;
        Ok((live.payload, live.admitted_at.elapsed()))
    }

    /// Drop a request in any state, e.g. when its connection closed.
    /// A worker still holding the old value will be discarded on return.
    pub fn cancel(&mut self, value: HandleValue) -> Option<T> {
        self.free_slot(value).map(|l| l.payload)
    }

    /// Requests admitted and not yet retired.
    pub fn pending(&self) -> usize {
        self.live
    }

    /// Requests currently waiting on a worker.
    pub fn deferred(&self) -> usize {
        self.deferred
    }

    /// Deferred requests that have been waiting longer than `max_age`.
    pub fn overdue(&self, max_age: Duration) -> Vec<(HandleValue, Duration)> {
        let now = Instant::now();
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let live = slot.live.as_ref()?;
                match live.state {
                    State::Deferred { since } => {
                        let waited = now.saturating_duration_since(since);
                        (waited > max_age)
                            .then(|| (HandleValue::new(idx as u32, slot.generation), waited))
                    }
                    State::Active => None,
                }
            })
            .collect()
    }

    /// Logged finalizations, oldest first. Always empty without `with_log`.
    pub fn take_finalized(&mut self) -> Vec<Finalized> {
        self.finalized.drain(..).collect()
    }
}

impl<T> RequestHost for RequestTable<T> {
    fn suspend(&mut self, handle: &RequestHandle) -> Result<(), HostError> {
        let value = handle.value();
        let live = self.lookup_mut(value).ok_or(HostError::Unknown(value))?;
        if live.state != State::Active {
            return Err(HostError::NotActive(value));
        }
        live.state = State::Deferred { since: Instant::now() };
        self.deferred += 1;
        Ok(())
    }

    fn reclaim(&mut self, value: HandleValue) -> Option<RequestHandle> {
        let live = self.lookup_mut(value)?;
        match live.state {
            State::Deferred { .. } => {
                live.state = State::Active;
                self.deferred -= 1;
                Some(RequestHandle::from_raw(value))
            }
            State::Active => None,
        }
    }

    fn finalize(&mut self, handle: RequestHandle, response: Response) -> Result<(), HostError> {
        let value = handle.value();
        let (_, elapsed) = self.retire(handle)?;
        tracing::debug!(handle = %value, status = response.status, ?elapsed, "request finalized");
        if self.log_cap > 0 {
            if self.finalized.len() == self.log_cap {
                self.finalized.pop_front();
            }
            self.finalized.push_back(Finalized { handle: value, response, elapsed });
        }
        Ok(())
    }
}
