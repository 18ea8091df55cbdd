use crate::docker::DockerRuntime;
use crate::ingest::FeedHealth;
use crate::pool::PoolStats;
use crate::registry::SharedRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Body of `POST /containers`
#[derive(Debug, Deserialize)]
struct LaunchRequest {
    image: String,
    #[serde(default = "default_tag")]
    tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

struct AdminContext {
    registry: SharedRegistry,
    feed_health: watch::Receiver<FeedHealth>,
    docker: Option<Arc<DockerRuntime>>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
    domain: String,
}

/// Management API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: SharedRegistry,
        feed_health: watch::Receiver<FeedHealth>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(AdminContext {
                registry,
                feed_health,
                docker: None,
                pool_stats: Arc::new(PoolStats::default()),
                auth_token,
                domain: "localhost".to_string(),
            }),
            shutdown_rx,
        }
    }

    /// Enable `POST /containers`
    pub fn with_docker(mut self, docker: Arc<DockerRuntime>) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.docker = Some(docker);
        }
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.domain = domain.into();
        }
        self
    }

    /// Report the proxy's forwarded request counters in `/health`
    pub fn with_pool_stats(mut self, stats: Arc<PoolStats>) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.pool_stats = stats;
        }
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin listener on {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, context: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthCheck") => health(&context),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/routes") => {
            let routes = context.registry.snapshot();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": routes.len(),
                    "routes": routes,
                }),
            )
        }

        (&Method::GET, path) if path.starts_with("/routes/") => {
            let name = path.trim_start_matches("/routes/");
            match context.registry.lookup(name) {
                Some(entry) => json_response(StatusCode::OK, serde_json::json!(*entry)),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({ "error": format!("no route named '{}'", name) }),
                ),
            }
        }

        (&Method::POST, "/containers") => {
            if !check_auth(&req, &context.auth_token) {
                warn!(%path, "Unauthorized admin API request");
                return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
            }
            let body = req.into_body().collect().await?.to_bytes();
            launch_container(&context, &body).await
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn health(context: &AdminContext) -> Response<Full<Bytes>> {
    let feed = context.feed_health.borrow().clone();
    let (status_code, status) = if feed.is_degraded() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    json_response(
        status_code,
        serde_json::json!({
            "status": status,
            "event_feed": feed,
            "routes": context.registry.len(),
            "requests": {
                "total": context.pool_stats.get_total_requests(),
                "failed": context.pool_stats.get_failed_requests(),
            },
        }),
    )
}

async fn launch_container(context: &AdminContext, body: &[u8]) -> Response<Full<Bytes>> {
    let Some(docker) = context.docker.as_ref() else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "status": "error", "error": "no container runtime connection" }),
        );
    };

    let request: LaunchRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "status": "error", "error": format!("invalid request body: {}", e) }),
            );
        }
    };
    if request.image.trim().is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "error": "image must not be empty" }),
        );
    }

    match docker.launch_container(&request.image, &request.tag).await {
        Ok(name) => {
            info!(image = %request.image, tag = %request.tag, container = %name, "Container launched via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "status": "success",
                    "container": format!("{}.{}", name, context.domain),
                }),
            )
        }
        Err(e) => {
            error!(image = %request.image, tag = %request.tag, error = %e, "Failed to launch container");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "status": "error", "error": e.to_string() }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RoutingEntry, ServiceRegistry};

    fn context(feed: FeedHealth) -> (AdminContext, watch::Sender<FeedHealth>) {
        let (tx, rx) = watch::channel(feed);
        let registry = ServiceRegistry::new();
        registry.upsert(RoutingEntry::new("web1", "172.17.0.5", 8080));
        (
            AdminContext {
                registry,
                feed_health: rx,
                docker: None,
                pool_stats: Arc::new(PoolStats::default()),
                auth_token: "secret".to_string(),
                domain: "localhost".to_string(),
            },
            tx,
        )
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_check_auth() {
        let req = Request::builder().header(AUTHORIZATION, "Bearer secret").body(()).unwrap();
        assert!(check_auth(&req, "secret"));

        let req = Request::builder().header(AUTHORIZATION, "Bearer wrong").body(()).unwrap();
        assert!(!check_auth(&req, "secret"));

        let req = Request::builder().body(()).unwrap();
        assert!(!check_auth(&req, "secret"));
    }

    #[tokio::test]
    async fn test_health_ok_and_degraded() {
        let (context, feed_tx) = context(FeedHealth::Streaming);
        context.pool_stats.record_request();
        context.pool_stats.record_request();
        context.pool_stats.record_failure();

        let ok = health(&context);
        assert_eq!(ok.status(), StatusCode::OK);
        let json = body_json(ok).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["event_feed"]["state"], "streaming");
        assert_eq!(json["routes"], 1);
        assert_eq!(json["requests"]["total"], 2);
        assert_eq!(json["requests"]["failed"], 1);

        feed_tx.send_replace(FeedHealth::Degraded {
            last_error: "connection refused".to_string(),
        });
        let degraded = health(&context);
        assert_eq!(degraded.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(degraded).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["event_feed"]["last_error"], "connection refused");
    }

    #[tokio::test]
    async fn test_launch_without_docker() {
        let (context, _feed_tx) = context(FeedHealth::Streaming);
        let response = launch_container(&context, br#"{"image":"nginx"}"#).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_launch_request_defaults_tag() {
        let request: LaunchRequest = serde_json::from_str(r#"{"image":"nginx"}"#).unwrap();
        assert_eq!(request.image, "nginx");
        assert_eq!(request.tag, "latest");
    }
}
