//! Inbound webhook server.
//!
//! Handlers are registered per literal path and wrapped so that every
//! invocation is counted, timed and classified by the status it produced.
//! The wrapper hands each handler a [`ResponseWriter`] whose status can only
//! be set once: the first `write_header` wins, later calls are ignored.
//!
//! A handler that panics is answered with 500. A request dropped before its
//! handler finishes, for instance because the client went away, is counted
//! as an error.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WebhookError};
use crate::stats::{metric_inc, millis_u64, ServerStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port 0 picks a free port; [`InboundServer::start`] reports the
    /// address actually bound.
    pub bind_addr: SocketAddr,
    /// Request bodies above this size are answered with 400.
    pub max_body_bytes: usize,
    /// How long [`InboundServer::stop`] waits for in-flight requests.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_body_bytes: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// A received request with its body fully read.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    /// Header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// `(name, value)` pairs for the text-valued headers.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
    }
}

/// Response under construction.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit the response status. Only the first call has any effect.
    pub fn write_header(&mut self, status: StatusCode) {
        match self.status {
            Some(committed) => debug!(
                committed = committed.as_u16(),
                ignored = status.as_u16(),
                "response status already written"
            ),
            None => self.status = Some(status),
        }
    }

    /// Append to the body, committing `200 OK` if no status was written.
    pub fn write(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The committed status, `200 OK` if nothing was written.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, request: InboundRequest, writer: &mut ResponseWriter);
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Build a handler from an async function returning status and body.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (StatusCode, String)> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> InboundHandler for HandlerFn<F>
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (StatusCode, String)> + Send + 'static,
{
    async fn handle(&self, request: InboundRequest, writer: &mut ResponseWriter) {
        let (status, body) = (self.0)(request).await;
        writer.write_header(status);
        writer.write(body.as_bytes());
    }
}

struct Listener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// HTTP server for webhooks sent to us by third parties.
pub struct InboundServer {
    config: ServerConfig,
    routes: Vec<(String, Arc<dyn InboundHandler>)>,
    stats: Arc<Mutex<ServerStats>>,
    listener: Option<Listener>,
}

impl InboundServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            listener: None,
        }
    }

    /// Route `path` to `handler`.
    ///
    /// Paths are literal: they must start with `/` and may not contain route
    /// parameters or wildcards.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed or duplicate path, or when the server
    /// is already running.
    pub fn register_handler(&mut self, path: impl Into<String>, handler: impl InboundHandler) -> Result<()> {
        let path = path.into();
        if self.listener.is_some() {
            return Err(WebhookError::validation("handlers must be registered before start"));
        }
        if !path.starts_with('/') || path.contains([':', '{', '}', '*']) {
            return Err(WebhookError::validation(format!("invalid handler path: {path}")));
        }
        if self.routes.iter().any(|(existing, _)| existing == &path) {
            return Err(WebhookError::validation(format!("handler already registered for {path}")));
        }

        debug!(path = %path, "inbound handler registered");
        self.routes.push((path, Arc::new(handler)));
        Ok(())
    }

    /// Bind the listening socket and serve on a background task.
    ///
    /// Returns once the socket is bound, with the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Err(WebhookError::server(format!("already listening on {}", listener.addr)));
        }

        let socket = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| WebhookError::server(format!("failed to bind {}: {e}", self.config.bind_addr)))?;
        let addr = socket
            .local_addr()
            .map_err(|e| WebhookError::server(format!("failed to read bound address: {e}")))?;

        let router = self.router();
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(socket, router)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "inbound server terminated with error");
            }
            info!(%addr, "inbound server stopped");
        });

        info!(%addr, routes = self.routes.len(), "inbound server listening");
        self.listener = Some(Listener { addr, shutdown, handle });
        Ok(addr)
    }

    /// Stop accepting connections and wait for in-flight requests, up to
    /// the configured shutdown timeout. Stopping a stopped server is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut listener) = self.listener.take() else {
            return Ok(());
        };

        listener.shutdown.cancel();
        match tokio::time::timeout(self.config.shutdown_timeout, &mut listener.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WebhookError::server(format!("listener task failed: {e}"))),
            Err(_) => {
                warn!(addr = %listener.addr, "in-flight requests outlived shutdown timeout");
                listener.handle.abort();
                Ok(())
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.addr)
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub async fn stats(&self) -> ServerStats {
        lock_stats(&self.stats).clone()
    }

    fn router(&self) -> Router {
        let max_body_bytes = self.config.max_body_bytes;
        self.routes.iter().fold(Router::new(), |router, (path, handler)| {
            let handler = Arc::clone(handler);
            let stats = Arc::clone(&self.stats);
            router.route(
                path,
                any(move |request: Request| {
                    serve_wrapped(Arc::clone(&handler), Arc::clone(&stats), max_body_bytes, request)
                }),
            )
        })
    }
}

impl Drop for InboundServer {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.shutdown.cancel();
        }
    }
}

/// Status recorded for a request whose future was dropped mid-handler.
const CLIENT_CLOSED_REQUEST: u16 = 499;

// Only held for counter updates, never across an await.
fn lock_stats(stats: &Mutex<ServerStats>) -> MutexGuard<'_, ServerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts one request from `begin` until it is dropped.
///
/// Closing out in `Drop` keeps `active_handlers` balanced when the request
/// future is cancelled before the handler returns.
struct InFlight {
    stats: Arc<Mutex<ServerStats>>,
    path: String,
    started: Instant,
    status: Option<StatusCode>,
}

impl InFlight {
    fn begin(stats: Arc<Mutex<ServerStats>>, path: String) -> Self {
        lock_stats(&stats).begin();
        Self {
            stats,
            path,
            started: Instant::now(),
            status: None,
        }
    }

    fn complete(&mut self, status: StatusCode) {
        self.status = Some(status);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let latency = self.started.elapsed();
        let status = match self.status {
            Some(status) => status.as_u16(),
            None => {
                warn!(path = %self.path, "request dropped before the handler finished");
                CLIENT_CLOSED_REQUEST
            }
        };

        lock_stats(&self.stats).finish(status, latency);
        metric_inc("webhook.server.requests");
        debug!(
            path = %self.path,
            status,
            latency_ms = millis_u64(latency),
            "inbound request handled"
        );
    }
}

async fn serve_wrapped(
    handler: Arc<dyn InboundHandler>,
    stats: Arc<Mutex<ServerStats>>,
    max_body_bytes: usize,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let mut in_flight = InFlight::begin(stats, path.clone());
    let mut writer = ResponseWriter::new();

    match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(body) => {
            let request = InboundRequest {
                method: parts.method,
                path: path.clone(),
                headers: parts.headers,
                body,
            };
            let handled = AssertUnwindSafe(handler.handle(request, &mut writer))
                .catch_unwind()
                .await;
            if handled.is_err() {
                error!(path = %path, "inbound handler panicked");
                writer = ResponseWriter::new();
                writer.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        Err(e) => {
            warn!(path = %path, error = %e, "failed to read request body");
            writer.write_header(StatusCode::BAD_REQUEST);
        }
    }

    in_flight.complete(writer.status());
    writer.into_response()
}
