//! Response-head type used on the write path.

use http::Response;

/// The header portion of a response, before its body is streamed: a
/// standard `http::Response` with an empty body placeholder.
pub type ResponseHead = Response<()>;
