//! The logical server: a handler plus the prefixes that route to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::endpoint::{EndPointManager, RegistrationError};
use crate::handler::Handler;
use crate::timeout::TimeoutManager;
use crate::transport::TlsAcceptor;

/// One logical HTTP server.
///
/// A server owns its request handler, its prefix set, its four phase
/// timeouts and (for https prefixes) its TLS acceptor. Several servers
/// can share one physical endpoint; the per-endpoint listener routes each
/// request to the server whose prefix matches best.
///
/// ```no_run
/// use std::convert::Infallible;
/// use bytes::Bytes;
/// use http::{Request, Response};
/// use http_body_util::Full;
/// use socket_http::endpoint::EndPointManager;
/// use socket_http::handler::make_handler;
/// use socket_http::protocol::body::ReqBody;
/// use socket_http::server::HttpServer;
///
/// async fn hello(_req: Request<ReqBody>) -> Result<Response<Full<Bytes>>, Infallible> {
///     Ok(Response::new(Full::new(Bytes::from_static(b"hello"))))
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let manager = EndPointManager::new();
///     let server = HttpServer::new(make_handler(hello));
///     server.add_prefix("http://*:8080/");
///     server.start(&manager).await.expect("registration failed");
///     // ... serve until shutdown ...
///     server.stop(&manager).await;
/// }
/// ```
pub struct HttpServer {
    handler: Arc<dyn Handler>,
    prefixes: Mutex<Vec<String>>,
    timeouts: Arc<TimeoutManager>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    /// Connections currently bound to this server, by connection id.
    connections: Mutex<HashMap<u64, CancellationToken>>,
    listening: AtomicBool,
}

impl HttpServer {
    pub fn new<H>(handler: H) -> Arc<Self>
    where
        H: Handler + 'static,
    {
        Self::build(Arc::new(handler), None)
    }

    /// A server whose https prefixes complete handshakes through the given
    /// acceptor. Without one, a secure listener drops accepted sockets.
    pub fn with_tls<H>(handler: H, tls: Arc<dyn TlsAcceptor>) -> Arc<Self>
    where
        H: Handler + 'static,
    {
        Self::build(Arc::new(handler), Some(tls))
    }

    fn build(handler: Arc<dyn Handler>, tls: Option<Arc<dyn TlsAcceptor>>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            prefixes: Mutex::new(Vec::new()),
            timeouts: Arc::new(TimeoutManager::default()),
            tls,
            connections: Mutex::new(HashMap::new()),
            listening: AtomicBool::new(false),
        })
    }

    /// Adds a prefix string to this server's set. Takes effect at the next
    /// [`start`](Self::start) (or immediately via
    /// [`EndPointManager::add_prefix`] when already listening).
    pub fn add_prefix(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        let mut prefixes = self.prefixes.lock().unwrap();
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.lock().unwrap().clone()
    }

    /// This server's phase timeout budgets; settable at any time.
    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub(crate) fn timeouts_arc(&self) -> Arc<TimeoutManager> {
        Arc::clone(&self.timeouts)
    }

    pub(crate) fn tls_acceptor(&self) -> Option<Arc<dyn TlsAcceptor>> {
        self.tls.clone()
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Registers this server's prefixes with `manager`. All-or-nothing:
    /// on failure nothing stays registered and the server is not
    /// listening.
    pub async fn start(self: &Arc<Self>, manager: &EndPointManager) -> Result<(), RegistrationError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = manager.add_server(self).await {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(prefixes = ?self.prefixes(), "server started");
        Ok(())
    }

    /// Deregisters the prefixes and force-closes every connection still
    /// bound to this server. Connections mid-upgrade are cancelled but
    /// their streams are left to the upgraded protocol.
    pub async fn stop(self: &Arc<Self>, manager: &EndPointManager) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        manager.remove_server(self).await;

        let connections: Vec<CancellationToken> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, guard)| guard).collect()
        };
        for guard in connections {
            guard.cancel();
        }
        info!("server stopped");
    }

    pub(crate) fn track_connection(&self, id: u64, guard: CancellationToken) {
        self.connections.lock().unwrap().insert(id, guard);
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.connections.lock().unwrap().remove(&id);
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("prefixes", &self.prefixes())
            .field("listening", &self.is_listening())
            .finish()
    }
}
