//! Streaming request decoding.
//!
//! [`RequestDecoder`] is a two-phase state machine: while no payload
//! decoder is installed it parses request heads; once a head announces a
//! payload it installs the matching [`PayloadDecoder`] and emits payload
//! items until EOF, then flips back to head parsing. This is what gives a
//! connection its strict request-at-a-time sequencing: the decoder never
//! yields the next head while a payload is outstanding.

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, RequestFrame};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

#[derive(Debug)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self { header_decoder: HeaderDecoder, payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = RequestFrame;
    type Error = ParseError;

    /// Returns a head, a payload item, or `None` when more bytes are
    /// needed. Errors are sticky at the connection level: the caller
    /// answers them with an error response and tears the connection down.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    // payload finished; next frame is a request head again
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
