//! Streaming request-body plumbing.
//!
//! The handler sees an `http_body::Body` ([`ReqBody`]); the connection
//! drives the producer half ([`ReqBodySender`]) concurrently so chunks
//! flow on demand, the entity-body budget is enforced at the network
//! edge, and anything the handler leaves unread can be drained before the
//! connection is reused.

mod req_body;

pub use req_body::ReqBody;
pub use req_body::ReqBodySender;
pub(crate) use req_body::drain_payload;
