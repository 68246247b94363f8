//! Core protocol types shared by the codecs, the connection state machine
//! and the handler boundary.
//!
//! - [`Message`] / [`PayloadItem`] / [`PayloadSize`]: head-or-payload
//!   framing used on both the read and write paths
//! - [`RequestHeader`] / [`ResponseHead`]: typed views of message heads
//! - [`body`]: the streaming request-body channel
//! - [`HttpError`] / [`ParseError`] / [`SendError`]: the error taxonomy;
//!   read-path protocol errors degrade to an HTTP error response and a
//!   connection teardown, write-path errors abandon the connection

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;
pub(crate) use request::header_contains_token;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;

/// The frame type produced by the request decoder: a parsed head with its
/// payload framing, or a payload item of the request in flight.
pub type RequestFrame = Message<(RequestHeader, PayloadSize)>;

/// The frame type consumed by the response encoder.
pub type ResponseFrame = Message<(ResponseHead, PayloadSize)>;
