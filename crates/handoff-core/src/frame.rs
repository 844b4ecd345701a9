//! Channel framing.
//!
//! One frame = one `HandleValue` in native byte order. Frames never leave
//! the process, so there is no endianness negotiation.

use crate::handle::HandleValue;

/// Bytes per frame.
pub const FRAME_LEN: usize = std::mem::size_of::<u64>();

pub type Frame = [u8; FRAME_LEN];

#[inline]
pub fn encode(value: HandleValue) -> Frame {
    value.0.to_ne_bytes()
}

#[inline]
pub fn decode(frame: &Frame) -> HandleValue {
    HandleValue(u64::from_ne_bytes(*frame))
}

/// Accumulates a frame out of arbitrarily short reads.
///
/// The transport is a byte stream, so a read may return any prefix of a
/// frame. `FrameBuf` keeps the bytes seen so far and only yields a value
/// once all `FRAME_LEN` bytes are present.
#[derive(Debug, Default)]
pub struct FrameBuf {
    bytes: Frame,
    filled: usize,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unfilled tail, to be passed to `read()`.
    #[inline]
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.bytes[self.filled..]
    }

    /// Record `n` bytes read into `spare()`. Returns the completed value,
    /// if this read finished the frame, and resets for the next one.
    pub fn advance(&mut self, n: usize) -> Option<HandleValue> {
        debug_assert!(self.filled + n <= FRAME_LEN);
        self.filled += n;
        if self.filled == FRAME_LEN {
            self.filled = 0;
            Some(decode(&self.bytes))
        } else {
            None
        }
    }

    /// Bytes of an incomplete frame currently held.
    #[inline]
    pub fn partial(&self) -> usize {
        self.filled
    }
}
