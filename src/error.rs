//! Proxy error codes and plain-text error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error type of relayed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy sends
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Malformed WebSocket upgrade request
    InvalidUpgrade,
    /// No backend registered under the requested name
    UnknownHost,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidUpgrade => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::InvalidUpgrade => "INVALID_UPGRADE",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(body))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(full_body(String::new()));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

fn full_body(body: String) -> ProxyBody {
    Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed()
}
