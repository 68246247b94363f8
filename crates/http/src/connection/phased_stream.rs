//! Transport wrapper that keeps the active phase timeout armed.
//!
//! The original contract is per read completion: while a connection waits
//! for the first byte of a request the idle budget runs; the moment data
//! arrives the header budget takes over, and it restarts on every
//! subsequent read until the head is complete. Sitting between the codec
//! and the raw transport is the one place every read completion is
//! visible, so the re-arming lives here instead of in the connection loop.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::timeout::TimeoutManager;
use crate::timer::ResumableTimer;
use crate::transport::BoxedStream;

/// Which timeout governs the connection's reads right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// Waiting for the first byte of the next request.
    Idle = 0,
    /// Head bytes have started arriving but the block is incomplete.
    Headers = 1,
    /// Body reads and dispatch; budgets are applied elsewhere.
    Inactive = 2,
}

/// Shared phase marker, written by the connection loop and read on the
/// I/O path.
#[derive(Clone)]
pub(crate) struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Phase::Inactive as u8)))
    }

    pub(crate) fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    fn get(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            0 => Phase::Idle,
            1 => Phase::Headers,
            _ => Phase::Inactive,
        }
    }
}

impl fmt::Debug for PhaseCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PhaseCell").field(&self.get()).finish()
    }
}

/// A [`BoxedStream`] that migrates the connection timer across read
/// completions according to the current [`Phase`].
pub(crate) struct PhasedStream {
    io: BoxedStream,
    timer: ResumableTimer,
    timeouts: Arc<TimeoutManager>,
    phase: PhaseCell,
}

impl PhasedStream {
    pub(crate) fn new(io: BoxedStream, timer: ResumableTimer, timeouts: Arc<TimeoutManager>, phase: PhaseCell) -> Self {
        Self { io, timer, timeouts, phase }
    }

    /// Releases the raw transport, for protocol upgrades.
    pub(crate) fn into_inner(self) -> BoxedStream {
        self.io
    }
}

impl AsyncRead for PhasedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.io).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                match this.phase.get() {
                    Phase::Idle => {
                        // the request exists now; header budget takes over
                        this.phase.set(Phase::Headers);
                        this.timer.start(this.timeouts.header_wait());
                    }
                    Phase::Headers => this.timer.start(this.timeouts.header_wait()),
                    Phase::Inactive => {}
                }
            }
        }

        result
    }
}

impl AsyncWrite for PhasedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl fmt::Debug for PhasedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhasedStream").field("phase", &self.phase).finish()
    }
}
