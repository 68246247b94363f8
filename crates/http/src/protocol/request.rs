//! Request-head view handed to routing and dispatch.

use http::{HeaderMap, Method, Request, Uri, Version};

/// The head of a parsed request, before a body stream is attached.
///
/// Wraps `http::Request<()>` and adds the connection-level predicates the
/// listener needs: whether the peer wants the connection kept alive, and
/// whether the request asks for a protocol upgrade.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Attaches a body, turning the head into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        self.inner.extensions_mut()
    }

    /// Whether the peer is eligible for connection reuse.
    ///
    /// HTTP/1.1 defaults to keep-alive unless the request opts out with
    /// `Connection: close`; HTTP/1.0 must opt in with
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version() {
            Version::HTTP_11 => !self.connection_has("close"),
            Version::HTTP_10 => self.connection_has("keep-alive"),
            _ => false,
        }
    }

    /// Whether the request asks to switch protocols (`Connection: upgrade`
    /// plus an `Upgrade` header naming the target).
    pub fn is_upgrade(&self) -> bool {
        self.connection_has("upgrade") && self.headers().contains_key(http::header::UPGRADE)
    }

    fn connection_has(&self, token: &str) -> bool {
        header_contains_token(self.headers(), http::header::CONNECTION, token)
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Case-insensitive search for `token` in a comma-separated header, across
/// all values of that header.
pub(crate) fn header_contains_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, connection: Option<&str>) -> RequestHeader {
        let mut builder = Request::builder().method(Method::GET).uri("/").version(version);
        if let Some(value) = connection {
            builder = builder.header(http::header::CONNECTION, value);
        }
        RequestHeader::from(builder.body(()).unwrap())
    }

    #[test]
    fn http11_keep_alive_by_default() {
        assert!(request(Version::HTTP_11, None).is_keep_alive());
        assert!(request(Version::HTTP_11, Some("keep-alive")).is_keep_alive());
        assert!(!request(Version::HTTP_11, Some("close")).is_keep_alive());
        assert!(!request(Version::HTTP_11, Some("Close")).is_keep_alive());
    }

    #[test]
    fn http10_keep_alive_is_opt_in() {
        assert!(!request(Version::HTTP_10, None).is_keep_alive());
        assert!(request(Version::HTTP_10, Some("keep-alive")).is_keep_alive());
    }

    #[test]
    fn upgrade_needs_both_headers() {
        let mut builder = Request::builder().method(Method::GET).uri("/ws").version(Version::HTTP_11);
        builder = builder.header(http::header::CONNECTION, "Upgrade").header(http::header::UPGRADE, "websocket");
        let header = RequestHeader::from(builder.body(()).unwrap());
        assert!(header.is_upgrade());

        let plain = request(Version::HTTP_11, Some("upgrade"));
        assert!(!plain.is_upgrade());
    }

}
