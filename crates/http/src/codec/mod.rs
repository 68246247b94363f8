//! Wire codecs.
//!
//! The read side decodes request heads and payloads incrementally from the
//! connection's accumulation buffer ([`RequestDecoder`]); the write side
//! serializes response heads and frames payloads ([`ResponseEncoder`]).
//! [`Http1Codec`] packages both behind one `tokio_util::codec::Framed`, so
//! a connection owns a single transport object, which is also what lets a
//! protocol upgrade recover the raw stream together with any read-ahead
//! bytes.

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{ParseError, RequestFrame, ResponseFrame, SendError};

/// The full-duplex HTTP/1.1 codec of one connection.
pub struct Http1Codec {
    request_decoder: RequestDecoder,
    response_encoder: ResponseEncoder,
}

impl Http1Codec {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for Http1Codec {
    fn default() -> Self {
        Self { request_decoder: RequestDecoder::new(), response_encoder: ResponseEncoder::new() }
    }
}

impl Decoder for Http1Codec {
    type Item = RequestFrame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.request_decoder.decode(src)
    }
}

impl Encoder<ResponseFrame> for Http1Codec {
    type Error = SendError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.response_encoder.encode(item, dst)
    }
}

impl std::fmt::Debug for Http1Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Codec").finish()
    }
}
