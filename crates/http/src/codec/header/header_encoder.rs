//! Response head serialization.
//!
//! The status line and header block are written exactly once per response;
//! the connection feeds the head through the encoder a single time and the
//! encoder state machine in [`super::super::ResponseEncoder`] rejects a
//! second head while a payload is in flight. `Content-Length` or
//! `Transfer-Encoding: chunked` is filled in from the payload framing so a
//! handler never has to set either by hand.

use crate::protocol::{PayloadSize, ResponseHead, SendError};

use bytes::{BufMut, BytesMut};

use http::{HeaderValue, Version, header};
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Space reserved up front for a typical serialized head.
const INIT_HEADER_SIZE: usize = 4 * 1024;

#[derive(Debug)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        match head.version() {
            Version::HTTP_10 | Version::HTTP_11 => {
                write!(
                    FastWrite(dst),
                    "HTTP/1.1 {} {}\r\n",
                    head.status().as_str(),
                    head.status().canonical_reason().unwrap_or("Unknown")
                )?;
            }
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        }

        // Announce the payload framing, except on 1xx heads (a 101 in
        // particular must not carry a Content-Length).
        if !head.status().is_informational() {
            match payload_size {
                PayloadSize::Length(n) => match head.headers_mut().get_mut(header::CONTENT_LENGTH) {
                    Some(value) => *value = n.into(),
                    None => {
                        head.headers_mut().insert(header::CONTENT_LENGTH, n.into());
                    }
                },
                PayloadSize::Chunked => match head.headers_mut().get_mut(header::TRANSFER_ENCODING) {
                    Some(value) => *value = HeaderValue::from_static("chunked"),
                    None => {
                        head.headers_mut().insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    }
                },
                PayloadSize::Empty => match head.headers_mut().get_mut(header::CONTENT_LENGTH) {
                    Some(value) => *value = 0.into(),
                    None => {
                        const ZERO_VALUE: HeaderValue = HeaderValue::from_static("0");
                        head.headers_mut().insert(header::CONTENT_LENGTH, ZERO_VALUE);
                    }
                },
            }
        }

        for (header_name, header_value) in head.headers().iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writer over `BytesMut` that skips the io::Write error plumbing; space
/// was reserved above.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode};

    fn encode(head: ResponseHead, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn fills_in_content_length() {
        let head = Response::builder().status(StatusCode::OK).body(()).unwrap();
        let encoded = encode(head, PayloadSize::Length(5));
        assert!(encoded.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(encoded.contains("content-length: 5\r\n"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[test]
    fn fills_in_chunked_transfer_encoding() {
        let head = Response::builder().status(StatusCode::OK).body(()).unwrap();
        let encoded = encode(head, PayloadSize::Chunked);
        assert!(encoded.contains("transfer-encoding: chunked\r\n"));
        assert!(!encoded.contains("content-length"));
    }

    #[test]
    fn informational_heads_carry_no_framing_headers() {
        let head = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "echo")
            .body(())
            .unwrap();
        let encoded = encode(head, PayloadSize::Empty);
        assert!(encoded.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(!encoded.contains("content-length"));
        assert!(encoded.contains("upgrade: echo\r\n"));
    }
}
