//! Listener prefix parsing and classification.
//!
//! A prefix is the unit of route registration: `scheme://host[:port]/path/`.
//! The host part may be a literal address, a resolvable name, or one of the
//! wildcards `*` (matches when no exact-host prefix does) and `+` (matches
//! any host, tried last). Prefixes are structural keys: two prefixes are
//! equal iff scheme, host, port and path all match, and that equality is
//! what routing tables and duplicate-registration checks key on.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// Error raised when a prefix string cannot be registered.
///
/// These are configuration errors: they surface synchronously from the
/// registration API and never mid-request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("prefix has no scheme separator: {0}")]
    MissingScheme(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("prefix host is empty")]
    EmptyHost,

    #[error("invalid prefix port: {0}")]
    InvalidPort(String),

    #[error("invalid prefix path: {reason}")]
    InvalidPath { reason: &'static str },
}

/// How a prefix participates in host matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// A literal host (or resolvable name), matched against the request host.
    Exact,
    /// `*`: matched only after every exact-host prefix has failed.
    AnyUnbound,
    /// `+`: matched last, after the `*` bucket.
    Any,
}

/// A parsed, normalized registration prefix.
///
/// The path is normalized to start and end with `/`. Percent sequences are
/// rejected at parse time: a prefix must be registered pre-decoded so that
/// route matching against decoded request paths is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerPrefix {
    secure: bool,
    host: String,
    port: u16,
    path: String,
}

impl ListenerPrefix {
    /// Parses a prefix string of the form `scheme://host[:port]/path[/]`.
    ///
    /// The port defaults to 80 for `http` and 443 for `https`. IPv6 literal
    /// hosts use the usual bracketed form (`http://[::1]:8080/`).
    pub fn parse(prefix: &str) -> Result<Self, PrefixError> {
        let (scheme, rest) =
            prefix.split_once("://").ok_or_else(|| PrefixError::MissingScheme(prefix.to_string()))?;

        let (secure, default_port) = match scheme {
            "http" => (false, 80),
            "https" => (true, 443),
            other => return Err(PrefixError::UnsupportedScheme(other.to_string())),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = split_host_port(authority, default_port);
        let port = port.map_err(|raw| PrefixError::InvalidPort(raw.to_string()))?;

        if host.is_empty() {
            return Err(PrefixError::EmptyHost);
        }

        if path.contains('%') {
            return Err(PrefixError::InvalidPath { reason: "percent sequences must be decoded before registration" });
        }
        if path.contains("//") {
            return Err(PrefixError::InvalidPath { reason: "path contains a double slash" });
        }

        let mut path = path.to_string();
        if !path.ends_with('/') {
            path.push('/');
        }

        Ok(Self { secure, host: host.to_string(), port, path })
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host_kind(&self) -> HostKind {
        match self.host.as_str() {
            "*" => HostKind::AnyUnbound,
            "+" => HostKind::Any,
            _ => HostKind::Exact,
        }
    }
}

impl fmt::Display for ListenerPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// Splits `host[:port]` at the last colon, leaving bracketed IPv6 literals
/// intact. Returns the raw port string in the error position when it does
/// not parse as a u16.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> (&str, Result<u16, &str>) {
    match authority.rsplit_once(':') {
        Some((host, raw_port)) if !raw_port.contains(']') => {
            let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
            (host, raw_port.parse::<u16>().map_err(|_| raw_port))
        }
        _ => {
            let host = authority.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(authority);
            (host, Ok(default_port))
        }
    }
}

/// Percent-decodes a request path for route matching.
///
/// Returns `Cow::Borrowed` when no decoding was needed. Invalid percent
/// sequences are left as-is rather than rejected, matching how the rest of
/// the request line was already accepted by the header parser.
pub(crate) fn percent_decode_path(s: &str) -> Cow<'_, str> {
    if !s.contains('%') {
        return Cow::Borrowed(s);
    }

    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    decoded.push(hi << 4 | lo);
                    i += 3;
                } else {
                    decoded.push(b'%');
                    i += 1;
                }
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
