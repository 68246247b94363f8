//! Chunked transfer-encoding decoder (RFC 9112 §7.1).
//!
//! Payload framing is `size-hex CRLF data CRLF ... 0 CRLF [trailers] CRLF`.
//! The decoder works line-at-a-time over the accumulation buffer: a size
//! line is only consumed once its CRLF has arrived, chunk data is emitted
//! as it arrives (one chunk may surface in several pieces), and extensions
//! and trailers are skipped. Any framing violation (bad size digit,
//! overflowing size, missing CRLF) is a hard decode error rather than
//! being absorbed.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};

/// Longest size line (hex digits plus extensions) the decoder will
/// accumulate while waiting for its CRLF.
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Awaiting a complete `size[;extension]` CRLF line.
    SizeLine,
    /// Inside chunk data, with the bytes still to be emitted.
    Data { remaining: u64 },
    /// CRLF closing a chunk's data.
    DataEnd,
    /// Trailer section after the zero-size chunk, up to its blank line.
    Trailers,
    /// Terminal chunk fully consumed.
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::SizeLine }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::SizeLine => {
                    let Some(line) = take_line(src, MAX_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    let size = parse_size_line(&line)?;
                    self.state = if size == 0 { State::Trailers } else { State::Data { remaining: size } };
                }

                State::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let bytes = src.split_to(take).freeze();

                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::DataEnd } else { State::Data { remaining: left } };

                    trace!(len = bytes.len(), "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    ensure!(&src[..2] == b"\r\n", ParseError::invalid_chunk("chunk data not closed by CRLF"));
                    src.advance(2);
                    self.state = State::SizeLine;
                }

                State::Trailers => {
                    let Some(line) = take_line(src, usize::MAX)? else {
                        return Ok(None);
                    };
                    // non-empty lines are trailer fields and are skipped
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }

                State::Done => {
                    trace!("finished reading chunked payload");
                    return Ok(Some(PayloadItem::Eof));
                }
            }
        }
    }
}

/// Consumes one CRLF-terminated line, returning its contents without the
/// terminator. `None` when the terminator has not arrived yet; a bare LF,
/// or more than `max` bytes with no terminator in sight, is a framing
/// error.
fn take_line(src: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, ParseError> {
    let Some(lf) = src.iter().position(|&b| b == b'\n') else {
        ensure!(src.len() <= max, ParseError::invalid_chunk("chunk line too long"));
        return Ok(None);
    };
    ensure!(lf > 0 && src[lf - 1] == b'\r', ParseError::invalid_chunk("bare LF in chunk framing"));

    let mut line = src.split_to(lf + 1);
    line.truncate(lf - 1);
    Ok(Some(line))
}

/// Parses a `size-hex [BWS] [;extension]` line into the chunk size.
/// Extensions are ignored; the size itself must be non-empty hex that
/// fits a u64.
fn parse_size_line(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(extension) => &line[..extension],
        None => line,
    };
    let digits = digits.trim_ascii_end();
    ensure!(!digits.is_empty(), ParseError::invalid_chunk("empty chunk size"));

    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_chunk("invalid chunk size digit")),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or(ParseError::invalid_chunk("chunk size overflows"))?;
    }
    Ok(size)
}
