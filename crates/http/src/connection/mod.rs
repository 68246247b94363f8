//! Per-socket connection handling.
//!
//! [`HttpConnection`] owns one accepted socket for its whole life and
//! drives the request/response cycle over it: incremental head parsing
//! under the idle/header-wait budgets, routing against the owning
//! listener's prefix table, concurrent handler + body streaming, the
//! response pipeline, and the keep-alive reuse or teardown decision. A
//! protocol upgrade ends the cycle by handing the raw stream to the
//! handler.

mod http_connection;
mod phased_stream;

pub use http_connection::HttpConnection;
