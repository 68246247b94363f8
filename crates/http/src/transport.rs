//! Transport abstractions.
//!
//! The connection layer consumes an opaque bidirectional byte stream. Plain
//! connections use the accepted [`TcpStream`] directly; secure listeners
//! delegate the server-side handshake to a [`TlsAcceptor`] collaborator and
//! consume whatever authenticated stream it yields. This crate implements
//! no TLS itself; certificate loading and protocol negotiation live behind
//! the acceptor trait.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// An asynchronous duplex byte stream usable as a connection transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A type-erased transport, plain or TLS-wrapped.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Server-side TLS handshake collaborator.
///
/// A secure endpoint listener without an acceptor closes accepted sockets
/// immediately: there is no certificate to present, so a handshake cannot
/// succeed. A handshake error is a connection teardown, never an HTTP
/// response, since no request exists yet.
#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream>;
}
