//! Payload codecs: Content-Length bounded and chunked framing, for both
//! request bodies (decode) and response bodies (encode).

pub(crate) mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
