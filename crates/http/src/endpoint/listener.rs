use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::HttpConnection;
use crate::endpoint::RegistrationError;
use crate::prefix::{HostKind, ListenerPrefix, percent_decode_path, split_host_port};
use crate::protocol::RequestHeader;
use crate::server::HttpServer;
use crate::timeout::TimeoutManager;
use crate::transport::{BoxedStream, TlsAcceptor};

/// Connection ids are allocated process-wide: a logical server may track
/// connections arriving through several listeners in one map.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// One listening socket bound to one (address, port).
///
/// The listener accepts continuously on its own task, spins up an
/// [`HttpConnection`] per accepted socket, and owns the routing table that
/// maps prefixes to the logical servers sharing this endpoint. Lifecycle
/// is `Created → Listening → Closed` with no reopen: it starts listening
/// on construction and is discarded once its last prefix is removed.
pub struct EndPointListener {
    endpoint: SocketAddr,
    local_addr: SocketAddr,
    secure: bool,
    tls: Option<Arc<dyn TlsAcceptor>>,
    timeouts: Arc<TimeoutManager>,
    /// Prefix → server snapshots; lookups load the current snapshot and
    /// never block on registration.
    routes: ArcSwap<RouteTable>,
    /// Connections accepted but not yet bound to a logical server.
    unregistered: Mutex<HashMap<u64, CancellationToken>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The three routing buckets, in lookup order: exact hosts, `*` hosts,
/// `+` hosts.
#[derive(Default)]
struct RouteTable {
    exact: HashMap<ListenerPrefix, Arc<HttpServer>>,
    unbound: Vec<(ListenerPrefix, Arc<HttpServer>)>,
    all: Vec<(ListenerPrefix, Arc<HttpServer>)>,
}

impl RouteTable {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.unbound.is_empty() && self.all.is_empty()
    }
}

impl EndPointListener {
    /// Binds the endpoint and starts the accept loop.
    pub(crate) async fn bind(
        endpoint: SocketAddr,
        secure: bool,
        tls: Option<Arc<dyn TlsAcceptor>>,
        timeouts: Arc<TimeoutManager>,
    ) -> io::Result<Arc<Self>> {
        let tcp = TcpListener::bind(endpoint).await?;
        let local_addr = tcp.local_addr()?;

        let listener = Arc::new(Self {
            endpoint,
            local_addr,
            secure,
            tls,
            timeouts,
            routes: ArcSwap::from_pointee(RouteTable::default()),
            unregistered: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(Arc::clone(&listener).accept_loop(tcp));
        *listener.accept_task.lock().unwrap() = Some(task);

        Ok(listener)
    }

    /// The address actually bound, with the real port for port-0 binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The (address, port) this listener was registered under.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub(crate) fn timeouts_arc(&self) -> &Arc<TimeoutManager> {
        &self.timeouts
    }

    async fn accept_loop(self: Arc<Self>, tcp: TcpListener) {
        info!(endpoint = %self.local_addr, secure = self.secure, "listening");
        loop {
            match tcp.accept().await {
                Ok((socket, remote_addr)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    Arc::clone(&self).process_accept(socket, remote_addr);
                }
                // transient on some platforms: a peer resets between SYN
                // and accept completion; keep draining the backlog
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!(endpoint = %self.local_addr, "connection reset during accept, re-accepting");
                }
                // any other failure aborts only the socket in question,
                // never the loop
                Err(e) => {
                    warn!(endpoint = %self.local_addr, cause = %e, "accept failed");
                }
            }
        }
    }

    fn process_accept(self: Arc<Self>, socket: TcpStream, remote_addr: SocketAddr) {
        // a secure endpoint without certificate material cannot complete
        // any handshake; fail closed instead of stringing the peer along
        if self.secure && self.tls.is_none() {
            debug!(endpoint = %self.local_addr, %remote_addr, "secure listener without an acceptor, dropping socket");
            return;
        }

        tokio::spawn(async move {
            let stream: BoxedStream = match &self.tls {
                Some(tls) => match tls.accept(socket).await {
                    Ok(stream) => stream,
                    // no HTTP request exists yet, so no HTTP answer: the
                    // handshake failure is a plain teardown
                    Err(e) => {
                        debug!(endpoint = %self.local_addr, %remote_addr, cause = %e, "tls handshake failed");
                        return;
                    }
                },
                None => Box::new(socket),
            };

            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let connection = HttpConnection::new(id, stream, remote_addr, Arc::clone(&self));
            self.watch(id, connection.guard());
            connection.serve().await;
        });
    }

    /// Tracks a connection that has not yet been bound to a server, so a
    /// listener close can force it down.
    fn watch(&self, id: u64, guard: CancellationToken) {
        if self.closed.load(Ordering::SeqCst) {
            guard.cancel();
            return;
        }
        self.unregistered.lock().unwrap().insert(id, guard);
    }

    /// A connection bound a request to a server; the listener no longer
    /// owns its shutdown.
    pub(crate) fn promote(&self, id: u64) {
        self.unregistered.lock().unwrap().remove(&id);
    }

    pub(crate) fn forget(&self, id: u64) {
        self.unregistered.lock().unwrap().remove(&id);
    }

    /// Closes the socket and force-closes every connection that never
    /// bound to a logical server.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }

        let pending: Vec<CancellationToken> = {
            let mut unregistered = self.unregistered.lock().unwrap();
            unregistered.drain().map(|(_, guard)| guard).collect()
        };
        for guard in pending {
            guard.cancel();
        }

        self.routes.store(Arc::new(RouteTable::default()));
        info!(endpoint = %self.local_addr, "listener closed");
    }

    /// Registers a prefix for `server`.
    ///
    /// Mutations rebuild the table and swap the snapshot atomically;
    /// in-flight lookups keep reading the old table. Callers serialize
    /// through the endpoint manager's lock, so no rcu retry loop is
    /// needed here.
    pub(crate) fn add_prefix(&self, prefix: &ListenerPrefix, server: &Arc<HttpServer>) -> Result<(), RegistrationError> {
        let current = self.routes.load_full();
        let mut next = RouteTable {
            exact: current.exact.clone(),
            unbound: current.unbound.clone(),
            all: current.all.clone(),
        };

        match prefix.host_kind() {
            HostKind::Exact => {
                if let Some(existing) = next.exact.get(prefix) {
                    if Arc::ptr_eq(existing, server) {
                        // re-registering the same prefix is a no-op
                        return Ok(());
                    }
                    return Err(RegistrationError::PrefixConflict { prefix: prefix.to_string() });
                }
                next.exact.insert(prefix.clone(), Arc::clone(server));
            }
            HostKind::AnyUnbound => Self::add_special(&mut next.unbound, prefix, server)?,
            HostKind::Any => Self::add_special(&mut next.all, prefix, server)?,
        }

        self.routes.store(Arc::new(next));
        Ok(())
    }

    fn add_special(
        bucket: &mut Vec<(ListenerPrefix, Arc<HttpServer>)>,
        prefix: &ListenerPrefix,
        server: &Arc<HttpServer>,
    ) -> Result<(), RegistrationError> {
        if let Some((_, existing)) = bucket.iter().find(|(p, _)| p.path() == prefix.path()) {
            if Arc::ptr_eq(existing, server) {
                return Ok(());
            }
            return Err(RegistrationError::PrefixConflict { prefix: prefix.to_string() });
        }
        bucket.push((prefix.clone(), Arc::clone(server)));
        Ok(())
    }

    /// Removes a prefix previously registered by `server`. Returns whether
    /// anything was removed.
    pub(crate) fn remove_prefix(&self, prefix: &ListenerPrefix, server: &Arc<HttpServer>) -> bool {
        let current = self.routes.load_full();
        let mut next = RouteTable {
            exact: current.exact.clone(),
            unbound: current.unbound.clone(),
            all: current.all.clone(),
        };

        let removed = match prefix.host_kind() {
            HostKind::Exact => match next.exact.get(prefix) {
                Some(existing) if Arc::ptr_eq(existing, server) => next.exact.remove(prefix).is_some(),
                _ => false,
            },
            HostKind::AnyUnbound => Self::remove_special(&mut next.unbound, prefix, server),
            HostKind::Any => Self::remove_special(&mut next.all, prefix, server),
        };

        if removed {
            self.routes.store(Arc::new(next));
        }
        removed
    }

    fn remove_special(
        bucket: &mut Vec<(ListenerPrefix, Arc<HttpServer>)>,
        prefix: &ListenerPrefix,
        server: &Arc<HttpServer>,
    ) -> bool {
        let before = bucket.len();
        bucket.retain(|(p, s)| !(p.path() == prefix.path() && Arc::ptr_eq(s, server)));
        bucket.len() != before
    }

    /// Whether no prefix is registered at all; the manager destroys the
    /// listener when this turns true.
    pub(crate) fn is_routing_empty(&self) -> bool {
        self.routes.load().is_empty()
    }

    /// Resolves the request against the routing table: longest matching
    /// path among exact-host prefixes whose host and port match, else the
    /// `*` bucket, else the `+` bucket. Returns `None` when nothing
    /// matches, in which case the caller answers 400 and closes.
    pub(crate) fn bind_request(&self, header: &RequestHeader) -> Option<(Arc<HttpServer>, ListenerPrefix)> {
        let default_port = if self.secure { 443 } else { 80 };

        // absolute-form targets carry their own authority; otherwise the
        // Host header decides
        let (host, port) = if let Some(uri_host) = header.uri().host() {
            (uri_host.to_string(), header.uri().port_u16().unwrap_or(default_port))
        } else {
            match header.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()) {
                Some(authority) => {
                    let (host, port) = split_host_port(authority, default_port);
                    (host.to_string(), port.unwrap_or(default_port))
                }
                None => (String::new(), default_port),
            }
        };

        let path = percent_decode_path(header.uri().path());
        self.search(&host, port, &path)
    }

    fn search(&self, host: &str, port: u16, path: &str) -> Option<(Arc<HttpServer>, ListenerPrefix)> {
        let routes = self.routes.load();
        let path_slash = if path.ends_with('/') { None } else { Some(format!("{path}/")) };

        if !host.is_empty() {
            let mut best: Option<(&ListenerPrefix, &Arc<HttpServer>)> = None;
            let mut best_length = 0;

            for (prefix, server) in routes.exact.iter() {
                if prefix.host() != host || prefix.port() != port {
                    continue;
                }
                let ppath = prefix.path();
                if path.starts_with(ppath) || path_slash.as_deref().is_some_and(|p| p.starts_with(ppath)) {
                    // first-found wins at equal length
                    if best.is_none() || ppath.len() > best_length {
                        best_length = ppath.len();
                        best = Some((prefix, server));
                    }
                }
            }

            if let Some((prefix, server)) = best {
                return Some((Arc::clone(server), prefix.clone()));
            }
        }

        Self::match_from_list(&routes.unbound, path, path_slash.as_deref())
            .or_else(|| Self::match_from_list(&routes.all, path, path_slash.as_deref()))
    }

    fn match_from_list(
        bucket: &[(ListenerPrefix, Arc<HttpServer>)],
        path: &str,
        path_slash: Option<&str>,
    ) -> Option<(Arc<HttpServer>, ListenerPrefix)> {
        Self::scan_list(bucket, path).or_else(|| path_slash.and_then(|p| Self::scan_list(bucket, p)))
    }

    fn scan_list(bucket: &[(ListenerPrefix, Arc<HttpServer>)], path: &str) -> Option<(Arc<HttpServer>, ListenerPrefix)> {
        let mut best: Option<(&ListenerPrefix, &Arc<HttpServer>)> = None;
        let mut best_length = 0;

        for (prefix, server) in bucket {
            let ppath = prefix.path();
            if path.starts_with(ppath) && (best.is_none() || ppath.len() > best_length) {
                best_length = ppath.len();
                best = Some((prefix, server));
            }
        }

        best.map(|(prefix, server)| (Arc::clone(server), prefix.clone()))
    }
}

impl fmt::Debug for EndPointListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndPointListener")
            .field("endpoint", &self.endpoint)
            .field("local_addr", &self.local_addr)
            .field("secure", &self.secure)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for EndPointListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::make_handler;
    use bytes::Bytes;
    use http::{Request, Response};
    use http_body_util::Full;
    use std::convert::Infallible;

    fn test_server() -> Arc<HttpServer> {
        HttpServer::new(make_handler(|_req: Request<crate::protocol::body::ReqBody>| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }))
    }

    fn prefix(s: &str) -> ListenerPrefix {
        ListenerPrefix::parse(s).unwrap()
    }

    async fn empty_listener() -> Arc<EndPointListener> {
        EndPointListener::bind("127.0.0.1:0".parse().unwrap(), false, None, Arc::default()).await.unwrap()
    }

    fn lookup(listener: &EndPointListener, host: &str, port: u16, path: &str) -> Option<ListenerPrefix> {
        listener.search(host, port, path).map(|(_, p)| p)
    }

    #[tokio::test]
    async fn exact_host_beats_wildcards() {
        let listener = empty_listener().await;
        let a = test_server();
        let b = test_server();
        let c = test_server();

        listener.add_prefix(&prefix("http://example.com:80/"), &a).unwrap();
        listener.add_prefix(&prefix("http://*:80/"), &b).unwrap();
        listener.add_prefix(&prefix("http://+:80/"), &c).unwrap();

        let (server, matched) = listener.search("example.com", 80, "/x").unwrap();
        assert!(Arc::ptr_eq(&server, &a));
        assert_eq!(matched.host(), "example.com");

        // unknown host falls to the `*` bucket before `+`
        let (server, _) = listener.search("other.example", 80, "/x").unwrap();
        assert!(Arc::ptr_eq(&server, &b));

        // no host at all skips the exact bucket entirely
        let (server, _) = listener.search("", 80, "/x").unwrap();
        assert!(Arc::ptr_eq(&server, &b));
    }

    #[tokio::test]
    async fn longest_path_wins() {
        let listener = empty_listener().await;
        let short = test_server();
        let long = test_server();

        listener.add_prefix(&prefix("http://example.com:80/"), &short).unwrap();
        listener.add_prefix(&prefix("http://example.com:80/api/"), &long).unwrap();

        let (server, matched) = listener.search("example.com", 80, "/api/users").unwrap();
        assert!(Arc::ptr_eq(&server, &long));
        assert_eq!(matched.path(), "/api/");

        let (server, _) = listener.search("example.com", 80, "/other").unwrap();
        assert!(Arc::ptr_eq(&server, &short));
    }

    #[tokio::test]
    async fn path_retries_with_trailing_slash() {
        let listener = empty_listener().await;
        let server = test_server();

        listener.add_prefix(&prefix("http://example.com:80/app/"), &server).unwrap();

        // "/app" only matches through the trailing-slash retry
        let matched = lookup(&listener, "example.com", 80, "/app");
        assert_eq!(matched.unwrap().path(), "/app/");

        assert!(lookup(&listener, "example.com", 80, "/application").is_none());
    }

    #[tokio::test]
    async fn port_must_match_for_exact_hosts() {
        let listener = empty_listener().await;
        let server = test_server();

        listener.add_prefix(&prefix("http://example.com:8080/"), &server).unwrap();

        assert!(lookup(&listener, "example.com", 8080, "/").is_some());
        assert!(lookup(&listener, "example.com", 80, "/").is_none());
    }

    #[tokio::test]
    async fn no_match_yields_none() {
        let listener = empty_listener().await;
        let server = test_server();

        listener.add_prefix(&prefix("http://example.com:80/api/"), &server).unwrap();

        assert!(lookup(&listener, "example.com", 80, "/outside").is_none());
        assert!(lookup(&listener, "unknown.example", 80, "/api/").is_none());
    }

    #[tokio::test]
    async fn duplicate_prefix_rules() {
        let listener = empty_listener().await;
        let a = test_server();
        let b = test_server();

        let p = prefix("http://example.com:80/app/");
        listener.add_prefix(&p, &a).unwrap();

        // same server: no-op
        listener.add_prefix(&p, &a).unwrap();

        // different server: conflict
        assert!(matches!(listener.add_prefix(&p, &b), Err(RegistrationError::PrefixConflict { .. })));

        // wildcard bucket enforces the same rule by path
        let w = prefix("http://*:80/shared/");
        listener.add_prefix(&w, &a).unwrap();
        listener.add_prefix(&w, &a).unwrap();
        assert!(matches!(listener.add_prefix(&w, &b), Err(RegistrationError::PrefixConflict { .. })));
    }

    #[tokio::test]
    async fn removal_empties_the_table() {
        let listener = empty_listener().await;
        let server = test_server();

        let p = prefix("http://example.com:80/app/");
        listener.add_prefix(&p, &server).unwrap();
        assert!(!listener.is_routing_empty());

        assert!(listener.remove_prefix(&p, &server));
        assert!(listener.is_routing_empty());
        assert!(!listener.remove_prefix(&p, &server));
    }
}
