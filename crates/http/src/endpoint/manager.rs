use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::endpoint::{EndPointListener, RegistrationError};
use crate::prefix::ListenerPrefix;
use crate::server::HttpServer;

/// Registry mapping (address, port) to its [`EndPointListener`].
///
/// There is exactly one listening socket per physical endpoint no matter
/// how many logical servers share it: a listener is created lazily when
/// the first prefix lands on its endpoint and destroyed when the last one
/// leaves. The registry is an owned object, not a process global:
/// construct one per process, or one per test.
///
/// All mutation runs under a single async lock. Registration is rare next
/// to request traffic, and the lock also serializes the copy-and-swap
/// route-table updates inside each listener.
pub struct EndPointManager {
    endpoints: Mutex<HashMap<SocketAddr, Arc<EndPointListener>>>,
}

impl EndPointManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { endpoints: Mutex::new(HashMap::new()) })
    }

    /// Registers every prefix of `server`, creating endpoint listeners as
    /// needed.
    ///
    /// All-or-nothing: if any prefix fails to parse, bind or register,
    /// the prefixes already added by this call are rolled back before the
    /// error returns.
    pub async fn add_server(&self, server: &Arc<HttpServer>) -> Result<(), RegistrationError> {
        let mut endpoints = self.endpoints.lock().await;
        let mut added: Vec<ListenerPrefix> = Vec::new();

        for raw in server.prefixes() {
            match Self::add_prefix_locked(&mut endpoints, &raw, server).await {
                Ok(prefix) => added.push(prefix),
                Err(e) => {
                    for prefix in &added {
                        Self::remove_prefix_locked(&mut endpoints, prefix, server).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Registers a single prefix string for `server`.
    pub async fn add_prefix(&self, raw: &str, server: &Arc<HttpServer>) -> Result<(), RegistrationError> {
        let mut endpoints = self.endpoints.lock().await;
        Self::add_prefix_locked(&mut endpoints, raw, server).await.map(|_| ())
    }

    /// Removes every prefix of `server`; listeners left without prefixes
    /// are closed and dropped from the registry.
    pub async fn remove_server(&self, server: &Arc<HttpServer>) {
        let mut endpoints = self.endpoints.lock().await;
        for raw in server.prefixes() {
            match ListenerPrefix::parse(&raw) {
                Ok(prefix) => Self::remove_prefix_locked(&mut endpoints, &prefix, server).await,
                Err(e) => warn!(prefix = %raw, cause = %e, "skipping unparsable prefix during removal"),
            }
        }
    }

    /// Removes a single prefix string previously registered by `server`.
    pub async fn remove_prefix(&self, raw: &str, server: &Arc<HttpServer>) -> Result<(), RegistrationError> {
        let prefix = ListenerPrefix::parse(raw)?;
        let mut endpoints = self.endpoints.lock().await;
        Self::remove_prefix_locked(&mut endpoints, &prefix, server).await;
        Ok(())
    }

    /// The listener registered at `endpoint`, if any.
    pub async fn listener_at(&self, endpoint: SocketAddr) -> Option<Arc<EndPointListener>> {
        self.endpoints.lock().await.get(&endpoint).cloned()
    }

    async fn add_prefix_locked(
        endpoints: &mut HashMap<SocketAddr, Arc<EndPointListener>>,
        raw: &str,
        server: &Arc<HttpServer>,
    ) -> Result<ListenerPrefix, RegistrationError> {
        let prefix = ListenerPrefix::parse(raw)?;
        let addr = resolve_host(prefix.host(), prefix.port()).await;

        let listener = match endpoints.entry(addr) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let listener = EndPointListener::bind(addr, prefix.secure(), server.tls_acceptor(), server.timeouts_arc())
                    .await
                    .map_err(|source| RegistrationError::Bind { addr, source })?;
                debug!(%addr, prefix = %prefix, "created endpoint listener");
                Arc::clone(entry.insert(listener))
            }
        };

        if let Err(e) = listener.add_prefix(&prefix, server) {
            // a listener created just for this prefix must not leak
            if listener.is_routing_empty() {
                listener.close();
                endpoints.remove(&addr);
            }
            return Err(e);
        }

        Ok(prefix)
    }

    async fn remove_prefix_locked(
        endpoints: &mut HashMap<SocketAddr, Arc<EndPointListener>>,
        prefix: &ListenerPrefix,
        server: &Arc<HttpServer>,
    ) {
        let addr = resolve_host(prefix.host(), prefix.port()).await;

        let Some(listener) = endpoints.get(&addr) else {
            return;
        };

        listener.remove_prefix(prefix, server);
        if listener.is_routing_empty() {
            listener.close();
            endpoints.remove(&addr);
            debug!(%addr, "endpoint listener removed");
        }
    }
}

impl fmt::Debug for EndPointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndPointManager").finish()
    }
}

/// Resolves a prefix host to the address its listener binds.
///
/// Literal addresses parse directly; the wildcards (and an empty host)
/// bind the unspecified address; symbolic names go through a resolver
/// lookup and fall back to the unspecified address when that fails.
async fn resolve_host(host: &str, port: u16) -> SocketAddr {
    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

    if host == "*" || host == "+" || host.is_empty() {
        return unspecified;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, port);
    }

    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().unwrap_or(unspecified),
        Err(e) => {
            warn!(host, cause = %e, "host lookup failed, binding the unspecified address");
            unspecified
        }
    }
}
