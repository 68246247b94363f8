//! Streaming response encoding.
//!
//! Mirror of the request decoder: a response head installs the matching
//! payload encoder, payload items stream through it, and the encoder is
//! retired once the payload completes so the next keep-alive response can
//! start clean. Feeding frames out of order is a hard error; that is the
//! guard that keeps header serialization a once-only event per response.

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseFrame, SendError};
use bytes::BytesMut;
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

#[derive(Debug)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl Encoder<ResponseFrame> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    // a repeated close is a no-op; a write after completion is not
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect response head but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);

                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadItem;
    use bytes::Bytes;
    use http::{Response, StatusCode};

    fn head(status: StatusCode, payload_size: PayloadSize) -> ResponseFrame {
        Message::Header((Response::builder().status(status).body(()).unwrap(), payload_size))
    }

    #[test]
    fn head_is_serialized_exactly_once() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(head(StatusCode::OK, PayloadSize::Chunked), &mut dst).unwrap();
        let after_head = dst.len();

        // a second head while the payload is open must not re-emit headers
        let result = encoder.encode(head(StatusCode::OK, PayloadSize::Chunked), &mut dst);
        assert!(result.is_err());
        assert_eq!(dst.len(), after_head);
    }

    #[test]
    fn chunked_payload_terminates_once() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(head(StatusCode::OK, PayloadSize::Chunked), &mut dst).unwrap();
        dst.clear();

        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"hi"))), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::<Bytes>::Eof), &mut dst).unwrap();
        assert_eq!(&dst[..], b"2\r\nhi\r\n0\r\n\r\n");

        // the response is complete; a stray write cannot corrupt the trailer
        let before = dst.len();
        assert!(encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"late"))), &mut dst).is_err());
        assert_eq!(dst.len(), before);
    }

    #[test]
    fn next_response_can_start_after_completion() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(head(StatusCode::OK, PayloadSize::Empty), &mut dst).unwrap();
        // empty payload retires immediately; the keep-alive follow-up is legal
        encoder.encode(head(StatusCode::OK, PayloadSize::Empty), &mut dst).unwrap();
    }
}
