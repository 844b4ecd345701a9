//! Pipe-backed notification channel.
//!
//! `channel()` creates a non-blocking, close-on-exec pipe. Workers write
//! handle frames into the `WriteEnd`; the reactor watches the `ReadEnd`
//! and drains it.
//!
//! Frames are 8 bytes, well under `PIPE_BUF`, so a single `write(2)` on a
//! real pipe is all-or-nothing and concurrent writers cannot interleave.
//! The framing code still handles short reads and writes because it is
//! generic over any `Read`/`Write`. On those transports the lock around
//! the writer keeps concurrent frames apart, but a frame that fails
//! half-written cannot be taken back: the writer is then torn and refuses
//! every later frame with `WriteError::Torn`.

use handoff_core::error::{HandoffError, ReadError, Result, WriteError};
use handoff_core::frame::{self, FrameBuf, FRAME_LEN};
use handoff_core::handle::{HandleValue, RequestHandle};
use handoff_core::sink::HandleSink;

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Sleep between retries while the pipe is full.
const STALL_BACKOFF: Duration = Duration::from_micros(200);

/// Writes whole frames to any byte sink.
pub struct FrameWriter<W> {
    inner: W,
    stall_timeout: Duration,
    torn: bool,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, stall_timeout: Duration) -> Self {
        Self { inner, stall_timeout, torn: false }
    }

    /// Write one frame, retrying short writes and would-block.
    ///
    /// Would-block is retried with a short sleep until `stall_timeout`
    /// passes without progress. This runs on a worker thread, so sleeping
    /// here is fine.
    ///
    /// A failure after part of the frame went out tears the writer.
    pub fn write_frame(&mut self, value: HandleValue) -> std::result::Result<(), WriteError> {
        if self.torn {
            return Err(WriteError::Torn);
        }
        let bytes = frame::encode(value);
        let mut off = 0;
        let mut stalled_since: Option<Instant> = None;

        while off < FRAME_LEN {
            let failed = match self.inner.write(&bytes[off..]) {
                Ok(0) => WriteError::Closed,
                Ok(n) => {
                    off += n;
                    stalled_since = None;
                    if off < FRAME_LEN {
                        tracing::warn!(handle = %value, written = off, "short channel write, retrying");
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() < self.stall_timeout {
                        thread::sleep(STALL_BACKOFF);
                        continue;
                    }
                    WriteError::Stalled
                }
                Err(e) => WriteError::from_io(&e),
            };
            if off > 0 {
                tracing::error!(handle = %value, written = off, error = %failed, "channel frame torn");
                self.torn = true;
            }
            return Err(failed);
        }
        Ok(())
    }

    /// True once a frame failed half-written.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reads whole frames from any non-blocking byte source.
pub struct FrameReader<R> {
    inner: R,
    buf: FrameBuf,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buf: FrameBuf::new() }
    }

    /// Next complete frame, `Ok(None)` if none is available yet.
    ///
    /// Bytes of an incomplete frame are kept for the next call; a caller
    /// never sees a fragment.
    pub fn read_frame(&mut self) -> std::result::Result<Option<HandleValue>, ReadError> {
        loop {
            match self.inner.read(self.buf.spare()) {
                Ok(0) => {
                    return Err(match self.buf.partial() {
                        0 => ReadError::Closed,
                        n => ReadError::Truncated(n),
                    });
                }
                Ok(n) => {
                    if let Some(value) = self.buf.advance(n) {
                        return Ok(Some(value));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::trace!(partial = self.buf.partial(), "channel drained");
                    return Ok(None);
                }
                Err(e) => return Err(ReadError::from_io(&e)),
            }
        }
    }

    /// Bytes of an incomplete frame currently buffered.
    pub fn partial(&self) -> usize {
        self.buf.partial()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

/// Worker side of the channel. Share it behind an `Arc`.
pub struct WriteEnd {
    fd: RawFd,
    writer: Mutex<FrameWriter<File>>,
}

impl WriteEnd {
    fn new(fd: OwnedFd, stall_timeout: Duration) -> Self {
        let file = File::from(fd);
        Self {
            fd: file.as_raw_fd(),
            writer: Mutex::new(FrameWriter::new(file, stall_timeout)),
        }
    }

    /// Write one raw value. Prefer `write_handle`, which consumes the handle.
    pub fn write_value(&self, value: HandleValue) -> std::result::Result<(), WriteError> {
        // A panic while holding the lock cannot leave a half frame behind
        // that the next writer would not also corrupt, so poison is ignored.
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_frame(value)
    }
}

impl HandleSink for WriteEnd {
    fn write_handle(&self, handle: RequestHandle) -> std::result::Result<(), WriteError> {
        self.write_value(handle.into_raw())
    }
}

impl AsRawFd for WriteEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Reactor side of the channel. Exactly one reader.
pub struct ReadEnd {
    reader: FrameReader<File>,
}

impl ReadEnd {
    fn new(fd: OwnedFd) -> Self {
        Self { reader: FrameReader::new(File::from(fd)) }
    }

    /// Next complete handle value; `Ok(None)` when nothing is ready.
    /// Never blocks.
    pub fn read_handle(&mut self) -> std::result::Result<Option<HandleValue>, ReadError> {
        self.reader.read_frame()
    }

    pub fn partial(&self) -> usize {
        self.reader.partial()
    }
}

impl AsRawFd for ReadEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }
}

/// Create a channel. Both ends are non-blocking and close-on-exec.
///
/// Fails with `ChannelCreation(errno)`, typically EMFILE/ENFILE.
pub fn channel(stall_timeout: Duration) -> Result<(WriteEnd, ReadEnd)> {
    let (read_fd, write_fd) = open_pipe().map_err(|e| {
        HandoffError::ChannelCreation(e.raw_os_error().unwrap_or(libc::EIO))
    })?;
    tracing::debug!(
        read_fd = read_fd.as_raw_fd(),
        write_fd = write_fd.as_raw_fd(),
        "channel created"
    );
    Ok((WriteEnd::new(write_fd, stall_timeout), ReadEnd::new(read_fd)))
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
            use nix::fcntl::OFlag;
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)
        }
    } else {
        fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
            let (r, w) = nix::unistd::pipe().map_err(io::Error::from)?;
            for fd in [r.as_raw_fd(), w.as_raw_fd()] {
                set_nonblocking_cloexec(fd).map_err(io::Error::from)?;
            }
            Ok((r, w))
        }

        fn set_nonblocking_cloexec(fd: RawFd) -> nix::Result<()> {
            use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

            let fl = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
            fcntl(fd, FcntlArg::F_SETFL(fl | OFlag::O_NONBLOCK))?;
            let fd_flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
            fcntl(fd, FcntlArg::F_SETFD(fd_flags | FdFlag::FD_CLOEXEC))?;
            Ok(())
        }
    }
}
