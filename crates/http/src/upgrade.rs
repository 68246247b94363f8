//! Protocol upgrade handoff.
//!
//! When a handler answers `101 Switching Protocols`, the connection writes
//! the response head and then surrenders its raw stream; HTTP framing
//! stops applying from that point on. The handler receives the stream
//! through an [`OnUpgrade`] handle planted in the request extensions:
//!
//! ```ignore
//! let on_upgrade = request.extensions_mut().remove::<OnUpgrade>().unwrap();
//! tokio::spawn(async move {
//!     let mut io = on_upgrade.upgraded().await?;
//!     // speak the sub-protocol (e.g. WebSocket framing) over `io`
//! });
//! ```
//!
//! Once ownership transfers, the connection never touches the stream again:
//! no shutdown, no further reads, even during forced server teardown. The
//! upgraded protocol owns its lifecycle.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::oneshot;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::transport::BoxedStream;

/// Why an awaited upgrade never arrived.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The handle was already taken and awaited elsewhere.
    #[error("upgrade handle already taken")]
    AlreadyTaken,

    /// The connection finished without switching protocols (the response
    /// was not a 101, or the connection failed first).
    #[error("connection was not upgraded")]
    NotUpgraded,
}

/// The raw duplex stream of an upgraded connection.
///
/// Bytes the connection had already read past the request head are served
/// before the underlying transport is touched, so no read-ahead is lost.
pub struct Upgraded {
    io: BoxedStream,
    read_buf: Bytes,
}

impl Upgraded {
    pub(crate) fn new(io: BoxedStream, read_buf: Bytes) -> Self {
        Self { io, read_buf }
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded").field("read_ahead", &self.read_buf.len()).finish()
    }
}

/// Request-extension handle through which a handler claims the upgraded
/// stream.
///
/// Present on requests that ask for an upgrade (`Connection: upgrade` plus
/// an `Upgrade` header). A handler that answers 101 without holding on to
/// this handle leaves the connection nothing to hand off to, and the
/// connection force-closes instead.
#[derive(Clone)]
pub struct OnUpgrade {
    rx: Arc<Mutex<Option<oneshot::Receiver<Upgraded>>>>,
}

impl OnUpgrade {
    /// Resolves once the connection has written the 101 head and released
    /// the raw stream.
    pub async fn upgraded(self) -> Result<Upgraded, UpgradeError> {
        let rx = self.rx.lock().unwrap().take().ok_or(UpgradeError::AlreadyTaken)?;
        rx.await.map_err(|_| UpgradeError::NotUpgraded)
    }
}

impl fmt::Debug for OnUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnUpgrade").finish()
    }
}

/// Connection-side half of the handoff.
pub(crate) struct UpgradeSender {
    tx: oneshot::Sender<Upgraded>,
}

impl UpgradeSender {
    /// Hands the stream to whoever holds the [`OnUpgrade`] handle. Fails
    /// when no one does; the caller should treat that as a force close
    /// (dropping `upgraded` closes the socket).
    pub(crate) fn send(self, upgraded: Upgraded) -> Result<(), Upgraded> {
        self.tx.send(upgraded)
    }
}

impl fmt::Debug for UpgradeSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeSender").finish()
    }
}

/// Creates a connected sender/handle pair for one request.
pub(crate) fn pair() -> (UpgradeSender, OnUpgrade) {
    let (tx, rx) = oneshot::channel();
    (UpgradeSender { tx }, OnUpgrade { rx: Arc::new(Mutex::new(Some(rx))) })
}
