//! The application callback boundary.
//!
//! A [`Handler`] is invoked once per bound request with the request view
//! (method, URI, headers, streaming body) and answers with a response
//! whose body is streamed back through the connection's codecs. Handlers
//! are object-safe so logical servers with different handler types share
//! one routing registry; [`make_handler`] adapts a plain async function.

use std::error::Error;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;

use crate::protocol::body::ReqBody;

/// Boxed error used across the handler boundary.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// The uniform response body type handlers produce.
///
/// A body with an exact size is sent with Content-Length framing; one
/// without is sent chunked.
pub type RespBody = BoxBody<Bytes, BoxError>;

/// A request handler bound to a logical server.
///
/// The handler runs inline on its connection's task: blocking in it stalls
/// that connection only, and its body reads are bounded by the server's
/// entity-body budget. Returning an error produces a 500 for the peer.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: Request<ReqBody>) -> Result<Response<RespBody>, BoxError>;
}

/// [`Handler`] implementation for plain async functions.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, B, E> Handler for HandlerFn<F>
where
    F: Fn(Request<ReqBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<B>, E>> + Send,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
    E: Into<BoxError>,
{
    async fn call(&self, req: Request<ReqBody>) -> Result<Response<RespBody>, BoxError> {
        match (self.f)(req).await {
            Ok(response) => Ok(response.map(|body| body.map_err(Into::into).boxed())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Wraps an async function into a [`Handler`].
pub fn make_handler<F, Fut, B, E>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<ReqBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<B>, E>> + Send,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
    E: Into<BoxError>,
{
    HandlerFn { f }
}
