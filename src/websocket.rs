//! WebSocket proxy handling
//!
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Backend
//! ```
//!
//! The backend handshake runs first; the client only gets its `101` once the
//! backend has accepted. Frames are relayed one at a time with their original
//! opcode (text stays text, binary stays binary). Ping/pong is answered on
//! each hop by the WebSocket stack itself.

use crate::error::{error_response, ProxyBody, ProxyErrorCode};
use crate::pool::strip_hop_by_hop;
use crate::registry::RoutingEntry;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

/// Timeouts applied to a WebSocket bridge
#[derive(Debug, Clone, Copy)]
pub struct WebSocketSettings {
    /// Bound on the backend TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on closing both legs once either side has finished
    pub close_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Which side ended a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    Client,
    Backend,
}

/// Check if a request asks for a WebSocket upgrade
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));

    let upgrades_to_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    has_upgrade_connection && upgrades_to_websocket
}

/// Proxy a WebSocket upgrade to `backend`.
///
/// Returns the response to send to the client: `101` with the bridge spawned
/// in the background, or an error response when the backend cannot be reached
/// or refuses the handshake.
pub async fn proxy_websocket(
    req: Request<Incoming>,
    backend: &RoutingEntry,
    settings: WebSocketSettings,
    request_id: &str,
) -> Response<ProxyBody> {
    let Some(client_key) = client_key(&req) else {
        return error_response(ProxyErrorCode::InvalidUpgrade, "Invalid WebSocket upgrade request");
    };

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let backend_url = format!("ws://{}{}", backend.authority(), path);

    let mut backend_req = match backend_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!(name = %backend.name, backend_url, error = %e, "Failed to build backend WebSocket request");
            return error_response(ProxyErrorCode::InternalError, "Failed to build backend request");
        }
    };
    for (name, value) in forwarded_headers(&req).iter() {
        backend_req.headers_mut().append(name.clone(), value.clone());
    }

    let connect = tokio::time::timeout(settings.connect_timeout, connect_async(backend_req)).await;
    let (backend_ws, backend_response) = match connect {
        Ok(Ok(connected)) => connected,
        Ok(Err(WsError::Http(response))) => {
            // Backend answered but declined the upgrade: relay its answer
            warn!(name = %backend.name, status = %response.status(), request_id, "Backend rejected WebSocket upgrade");
            let body = response.body().clone().unwrap_or_default();
            return Response::builder()
                .status(response.status())
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| error_response(ProxyErrorCode::ConnectionFailed, "Backend rejected WebSocket upgrade"));
        }
        Ok(Err(e)) => {
            warn!(name = %backend.name, backend_url, request_id, error = %e, "Failed to connect to backend WebSocket");
            return error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
        Err(_) => {
            warn!(
                name = %backend.name,
                backend_url,
                request_id,
                timeout_secs = settings.connect_timeout.as_secs(),
                "Backend WebSocket connect timed out"
            );
            return error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Backend WebSocket handshake timed out after {} seconds",
                    settings.connect_timeout.as_secs()
                ),
            );
        }
    };

    let accept = derive_accept_key(client_key.as_bytes());
    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = backend_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to build 101 response");
            return error_response(ProxyErrorCode::InternalError, "Failed to accept upgrade");
        }
    };

    info!(name = %backend.name, backend_url, request_id, "WebSocket upgrade successful");

    let name = backend.name.clone();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client_ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                let ended_by = bridge(client_ws, backend_ws, settings.close_timeout).await;
                debug!(name = %name, request_id, ?ended_by, "WebSocket connection closed");
            }
            Err(e) => {
                // Backend leg is dropped here, which closes its socket
                warn!(name = %name, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Relay frames between two WebSocket streams until either side finishes.
///
/// The first direction to end cancels the other; both sinks are then closed
/// within `close_timeout`.
pub async fn bridge<C, B>(
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
    close_timeout: Duration,
) -> BridgeEnd
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let ended_by = tokio::select! {
        result = relay(&mut client_rx, &mut backend_tx) => {
            if let Err(e) = result {
                debug!(error = %e, "Client to backend relay ended with error");
            }
            BridgeEnd::Client
        }
        result = relay(&mut backend_rx, &mut client_tx) => {
            if let Err(e) = result {
                debug!(error = %e, "Backend to client relay ended with error");
            }
            BridgeEnd::Backend
        }
    };

    let closed = tokio::time::timeout(close_timeout, async {
        let _ = client_tx.close().await;
        let _ = backend_tx.close().await;
    })
    .await;
    if closed.is_err() {
        debug!(?ended_by, "Timed out closing WebSocket bridge; dropping sockets");
    }

    ended_by
}

/// Copy messages from `rx` to `tx` until a close frame, end of stream, or error
async fn relay<R, T>(rx: &mut R, tx: &mut T) -> Result<(), WsError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    T: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.next().await {
        match message? {
            message @ (Message::Text(_) | Message::Binary(_)) => tx.send(message).await?,
            Message::Close(frame) => {
                let _ = tx.send(Message::Close(frame)).await;
                return Ok(());
            }
            // Control frames are answered per hop
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(())
}

/// `Sec-WebSocket-Key` of a well-formed version 13 upgrade
fn client_key<B>(req: &Request<B>) -> Option<String> {
    if req.method() != Method::GET {
        return None;
    }
    let version_ok = req
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");
    if !version_ok {
        return None;
    }
    req.headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.trim().is_empty())
        .map(|k| k.trim().to_string())
}

/// Caller headers to carry over to the backend handshake.
///
/// The handshake headers themselves are regenerated for the new connection.
/// Extensions are not offered since frames are relayed uncompressed.
fn forwarded_headers<B>(req: &Request<B>) -> hyper::HeaderMap {
    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    for name in [HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_ACCEPT] {
        headers.remove(name);
    }
    headers.remove(hyper::header::CONTENT_LENGTH);
    headers
}
