//! Endpoint ownership and prefix routing.
//!
//! [`EndPointManager`] is the process-wide registry: one
//! [`EndPointListener`] (one listening socket) per (address, port), shared
//! by every logical server with a prefix there. Each listener owns the
//! accept loop for its socket and the routing table consulted on every
//! request; lookups read an immutable snapshot, so registration never
//! blocks or tears an in-flight match.

mod listener;
mod manager;

pub use listener::EndPointListener;
pub use manager::EndPointManager;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::prefix::PrefixError;

/// Errors raised synchronously by the prefix registration API.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    #[error("prefix {prefix} is already registered to another server")]
    PrefixConflict { prefix: String },

    #[error("binding {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}
