use crate::config::ProxySettings;
use crate::error::{error_response, ProxyBody, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::registry::SharedRegistry;
use crate::websocket::{self, WebSocketSettings};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Per-request state shared by every connection
struct ProxyContext {
    registry: SharedRegistry,
    pool: ConnectionPool,
    request_timeout: Duration,
    websocket: WebSocketSettings,
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: SharedRegistry,
        settings: &ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: settings.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(settings.pool_idle_timeout_secs),
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.request_timeout(),
        });

        Self {
            bind_addr,
            context: Arc::new(ProxyContext {
                registry,
                pool,
                request_timeout: settings.request_timeout(),
                websocket: WebSocketSettings {
                    connect_timeout: settings.websocket_connect_timeout(),
                    close_timeout: settings.websocket_close_timeout(),
                },
            }),
            shutdown_rx,
        }
    }

    /// Counters of requests forwarded to backends
    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.context.pool.stats()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy listener on {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, context: Arc<ProxyContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { Ok::<_, hyper::Error>(handle_request(req, context, addr).await) }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(&req) else {
        return error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
    };
    let Some(name) = routing_key(&hostname) else {
        return error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
    };

    // Rejection is decided from the registry alone; no backend is contacted
    let Some(backend) = context.registry.lookup(name) else {
        debug!(hostname, name = %name, request_id, "No backend registered");
        return error_response(ProxyErrorCode::UnknownHost, format!("No backend registered for '{}'", name));
    };

    // Overwrite rather than append X-Forwarded-* so clients cannot spoof them
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    match headers.get(hyper::header::HOST).cloned() {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            if let Ok(value) = HeaderValue::from_str(&hostname) {
                headers.insert(X_FORWARDED_HOST, value);
            }
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(
        hostname,
        method = %req.method(),
        uri = %req.uri(),
        backend = %backend.authority(),
        request_id,
        "Incoming request"
    );

    if websocket::is_websocket_upgrade(&req) {
        return websocket::proxy_websocket(req, &backend, context.websocket, &request_id).await;
    }

    let result = tokio::time::timeout(context.request_timeout, context.pool.send_request(req, &backend)).await;

    match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(
                name = %backend.name,
                backend = %backend.authority(),
                request_id,
                connect = e.is_connect(),
                error = %e,
                "Failed to forward request"
            );
            error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            context.pool.stats().record_failure();
            warn!(
                name = %backend.name,
                backend = %backend.authority(),
                request_id,
                timeout_secs = context.request_timeout.as_secs(),
                "Request timed out"
            );
            error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", context.request_timeout.as_secs()),
            )
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Lowercased hostname from the Host header (or the URI authority for HTTP/2),
/// without port.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(hyper::header::HOST) {
        Some(h) => h.to_str().ok()?,
        None => req.uri().host()?,
    };

    // IP literals are accepted but never match a container name, so they
    // end in 404 rather than 400
    if let Some(rest) = raw.strip_prefix('[') {
        let (literal, _) = rest.split_once(']')?;
        if literal.is_empty() || !literal.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return None;
        }
        return Some(format!("[{}]", literal.to_ascii_lowercase()));
    }

    // Strip port if present
    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Container names may also carry underscores
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Left-most DNS label of `hostname`
fn routing_key(hostname: &str) -> Option<&str> {
    hostname.split('.').next().filter(|label| !label.is_empty())
}
