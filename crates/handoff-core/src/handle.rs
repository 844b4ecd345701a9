//! Request handle types.
//!
//! A `RequestHandle` is the one ownership token that crosses the thread
//! boundary. It is move-only: whoever holds it owns the right to finish
//! the request. Entering the channel consumes it (`into_raw`), and only
//! the host can turn a delivered raw value back into a handle.

use std::fmt;

/// Raw 64-bit handle value as carried on the wire.
///
/// Layout: `[generation:32][slot:32]`. The generation is bumped every time
/// the host retires a slot, so a stale or duplicated value never matches
/// the request currently living in that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HandleValue(pub u64);

impl HandleValue {
    #[inline]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot(), self.generation())
    }
}

/// Exclusive ownership token for one in-flight request.
///
/// Deliberately neither `Clone` nor `Copy`. It is `Send` so a worker can
/// carry it; the reactor gets a fresh one back from
/// [`RequestHost::reclaim`](crate::host::RequestHost::reclaim).
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHandle {
    value: HandleValue,
}

impl RequestHandle {
    /// Mint a handle. Only a `RequestHost` should call this.
    #[inline]
    pub fn from_raw(value: HandleValue) -> Self {
        Self { value }
    }

    /// Peek at the value without giving up ownership.
    #[inline]
    pub fn value(&self) -> HandleValue {
        self.value
    }

    /// Consume the handle for transport.
    #[inline]
    pub fn into_raw(self) -> HandleValue {
        self.value
    }
}
