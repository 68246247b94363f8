//! An HTTP/1.1 listener built directly on stream sockets.
//!
//! This crate provides the same contract as a platform HTTP listener
//! without depending on one: prefix-based request routing, keep-alive
//! connection reuse, chunked transfer encoding, per-phase network
//! timeouts, and a hook to upgrade a connection to another protocol. It
//! is built on tokio, with one asynchronous task per accepted connection.
//!
//! # Features
//!
//! - Prefix routing: register `scheme://host[:port]/path/` prefixes per
//!   logical server; requests bind to the longest matching prefix, with
//!   `*` and `+` wildcard hosts tried after exact hosts
//! - One listening socket per (address, port), shared by every server
//!   with a prefix there
//! - Keep-alive reuse with unread-body draining, chunked and
//!   Content-Length bodies in both directions, `Expect: 100-continue`
//! - Four independent phase timeouts (idle, header-wait, entity-body,
//!   drain), adjustable at runtime
//! - Protocol upgrade: a 101 response hands the handler the raw duplex
//!   stream, read-ahead included
//! - TLS as a collaborator: an `https` prefix delegates the server-side
//!   handshake to a [`transport::TlsAcceptor`] implementation
//!
//! # Example
//!
//! ```no_run
//! use std::convert::Infallible;
//! use std::error::Error;
//!
//! use bytes::Bytes;
//! use http::{Request, Response, StatusCode};
//! use http_body_util::Full;
//! use tracing::Level;
//! use tracing_subscriber::FmtSubscriber;
//!
//! use socket_http::endpoint::EndPointManager;
//! use socket_http::handler::make_handler;
//! use socket_http::protocol::body::ReqBody;
//! use socket_http::server::HttpServer;
//!
//! async fn hello_world(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, Infallible> {
//!     let response = Response::builder()
//!         .status(StatusCode::OK)
//!         .body(Full::new(Bytes::from_static(b"Hello World!\r\n")))
//!         .unwrap();
//!     Ok(response)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber)?;
//!
//!     let manager = EndPointManager::new();
//!
//!     let server = HttpServer::new(make_handler(hello_world));
//!     server.add_prefix("http://*:8080/");
//!     server.start(&manager).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop(&manager).await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`endpoint`]: the (address, port) registry, the per-endpoint accept
//!   loop and the prefix routing table
//! - [`connection`]: the per-socket protocol state machine: parsing,
//!   phase timeouts, dispatch, reuse, upgrade
//! - [`codec`]: request/response head and body codecs
//! - [`protocol`]: message types, request/response views, body streaming,
//!   error taxonomy
//! - [`server`] / [`handler`]: the logical server and its application
//!   callback
//! - [`prefix`], [`timer`], [`timeout`], [`transport`], [`upgrade`]:
//!   supporting pieces
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - TLS is consumed as an opaque authenticated stream; certificate
//!   loading and the handshake protocol live behind the acceptor trait
//! - Maximum request head size: 32 KiB; maximum header count: 64

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod handler;
pub mod prefix;
pub mod protocol;
pub mod server;
pub mod timeout;
pub mod timer;
pub mod transport;
pub mod upgrade;

mod utils;
pub(crate) use utils::ensure;
