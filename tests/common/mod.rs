//! Shared helpers for integration tests: in-process backends and raw HTTP clients

#![allow(dead_code)]

use dockgate::config::ProxySettings;
use dockgate::proxy::ProxyServer;
use dockgate::registry::SharedRegistry;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// Proxy
// ============================================================================

/// Proxy listening on an ephemeral loopback port
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl TestProxy {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub async fn spawn_proxy(registry: SharedRegistry) -> TestProxy {
    spawn_proxy_with(registry, ProxySettings::default()).await
}

pub async fn spawn_proxy_with(registry: SharedRegistry, settings: ProxySettings) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::new(addr, registry, &settings, shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    TestProxy { addr, shutdown_tx }
}

/// A loopback port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// HTTP backend
// ============================================================================

/// One request as seen by the backend
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// In-process hyper backend that records every request
///
/// - `/status/{code}` answers with that status
/// - `/slow` answers after three seconds
/// - anything else answers `200` with `backend {name}: {method} {uri}`
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    pub connections: Arc<AtomicUsize>,
}

impl HttpBackend {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests.lock().last().cloned().expect("backend received no request")
    }
}

pub async fn spawn_http_backend(name: &'static str) -> HttpBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let recorded = Arc::clone(&requests);
    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = Arc::clone(&recorded);
                    async move { Ok::<_, hyper::Error>(backend_response(name, req, recorded).await) }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    HttpBackend {
        addr,
        requests,
        connections,
    }
}

async fn backend_response(
    name: &'static str,
    req: Request<Incoming>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let uri = parts.uri.to_string();

    recorded.lock().push(RecordedRequest {
        method: parts.method.to_string(),
        uri: uri.clone(),
        headers: parts.headers,
        body,
    });

    if let Some(code) = parts.uri.path().strip_prefix("/status/") {
        let status = code.parse().ok().and_then(|c| StatusCode::from_u16(c).ok()).unwrap_or(StatusCode::OK);
        let mut response = Response::new(Full::new(Bytes::from(format!("status {}", status.as_u16()))));
        *response.status_mut() = status;
        return response;
    }

    if parts.uri.path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    let mut response = Response::new(Full::new(Bytes::from(format!("backend {}: {} {}", name, parts.method, uri))));
    response.headers_mut().insert("x-backend", HeaderValue::from_static(name));
    response
}

/// Backend that sends response headers and `partial_body`, then holds the
/// connection open without sending the rest
pub async fn spawn_stalled_backend(content_length: usize, partial_body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", content_length, partial_body);
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(stream);
            });
        }
    });

    addr
}

// ============================================================================
// WebSocket backend
// ============================================================================

/// In-process WebSocket backend
///
/// Every connection is greeted with a text frame, then frames are echoed with
/// their original type. A path containing `close-after-greeting` makes the
/// backend close right after the greeting. Offers containing `superchat` get
/// that subprotocol selected.
pub struct WsBackend {
    pub addr: SocketAddr,
    pub uris: Arc<Mutex<Vec<String>>>,
    pub closed_rx: mpsc::UnboundedReceiver<()>,
}

pub const GREETING: &str = "hello from backend";

pub async fn spawn_ws_backend() -> WsBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uris = Arc::new(Mutex::new(Vec::new()));
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    let recorded = Arc::clone(&uris);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let recorded = Arc::clone(&recorded);
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let uri = Arc::new(Mutex::new(String::new()));
                let seen = Arc::clone(&uri);
                let callback = move |req: &WsRequest, mut response: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    *seen.lock() = req.uri().to_string();
                    let offers_superchat = req
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.split(',').any(|p| p.trim() == "superchat"));
                    if offers_superchat {
                        response
                            .headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("superchat"));
                    }
                    Ok(response)
                };

                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let uri = uri.lock().clone();
                recorded.lock().push(uri.clone());

                if ws.send(Message::text(GREETING)).await.is_err() {
                    return;
                }

                if uri.contains("close-after-greeting") {
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                } else {
                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(_) | Message::Binary(_) => {
                                if ws.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });

    WsBackend { addr, uris, closed_rx }
}

// ============================================================================
// Raw HTTP client
// ============================================================================

/// Parsed HTTP/1.x response
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send a raw request (which must ask for `Connection: close`) and read the
/// whole response
pub async fn raw_request(port: u16, request: &str) -> RawResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();

    parse_response(&String::from_utf8_lossy(&buf))
}

/// GET `path` with the given Host header
pub async fn http_get_with_host(port: u16, host: &str, path: &str) -> RawResponse {
    raw_request(
        port,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host),
    )
    .await
}

fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    let body = if chunked { dechunk(body) } else { body.to_string() };

    RawResponse { status, headers, body }
}

fn dechunk(mut body: &str) -> String {
    let mut out = String::new();
    while let Some((size, rest)) = body.split_once("\r\n") {
        let Ok(size) = usize::from_str_radix(size.trim(), 16) else {
            break;
        };
        if size == 0 || rest.len() < size {
            break;
        }
        out.push_str(&rest[..size]);
        body = rest[size..].trim_start_matches("\r\n");
    }
    out
}
