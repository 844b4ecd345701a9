//! Worker-side write abstraction.
//!
//! A `HandleSink` is what a finished worker writes its handle into.
//!
//! # Implementors
//!
//! - `WriteEnd` (default, `handoff-module`): write end of a non-blocking
//!   pipe watched by the reactor.

use crate::error::WriteError;
use crate::handle::RequestHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hands a completed request back to the reactor.
///
/// **Contract:**
/// - One call per handle; the handle is consumed whether or not it succeeds.
/// - Safe to call from many threads at once: frames never interleave.
/// - May block briefly on a full transport, never on the reactor.
pub trait HandleSink: Send + Sync {
    fn write_handle(&self, handle: RequestHandle) -> Result<(), WriteError>;
}

/// Process-wide "is the channel still usable" flag.
///
/// Flipped once, never back: a transport error on either end means no
/// further handle can be trusted to arrive, so new deferrals are refused
/// until restart.
#[derive(Debug, Clone, Default)]
pub struct ChannelHealth {
    degraded: Arc<AtomicBool>,
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Mark degraded. Returns `true` for the call that flipped it.
    pub fn degrade(&self) -> bool {
        !self.degraded.swap(true, Ordering::AcqRel)
    }
}
