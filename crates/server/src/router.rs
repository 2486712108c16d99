//! Protocol detection for freshly accepted sockets.
//!
//! Every connection starts as an HTTP/1.1 request. The router reads the
//! request head (bounded in size and time), then either promotes the socket
//! to a [`WebSocketConnection`] or hands the parsed request to the plain
//! HTTP endpoints.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use agentscope_protocol::ConnectionId;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connection::{ConnectionObserver, WebSocketConnection};
use crate::handshake;
use crate::http::HttpResponse;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Bounds on reading a request head from an unidentified peer
#[derive(Debug, Clone, Copy)]
pub struct HeaderLimits {
    pub max_bytes: usize,
    pub timeout: Duration,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Errors while identifying a connection
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request header exceeds {max} bytes")]
    HeaderTooLarge { max: usize },

    #[error("timed out waiting for the request header")]
    HeaderTimeout,

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("peer closed before sending a complete request header")]
    ClosedEarly,
}

/// A parsed HTTP/1.1 request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Bytes received after the header terminator.
    pub leftover: Bytes,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Parse a request head (everything before `\r\n\r\n`).
pub fn parse_head(head: &[u8]) -> Result<HttpRequest, RouteError> {
    let head = std::str::from_utf8(head).map_err(|_| RouteError::Malformed("non-UTF-8 header"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RouteError::Malformed("bad request line"));
    };
    if method.is_empty() || !target.starts_with('/') {
        return Err(RouteError::Malformed("bad request line"));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(RouteError::Malformed("unsupported HTTP version"));
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(RouteError::Malformed("header line without colon"))?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(RouteError::Malformed("empty header name"));
        }
        let value = value.trim();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        headers,
        ..HttpRequest::default()
    })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Read bytes until the header terminator and parse the head. Whatever
/// arrived past the terminator is kept in `leftover`.
pub async fn read_request<S>(stream: &mut S, limits: HeaderLimits) -> Result<HttpRequest, RouteError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let accumulate = async {
        loop {
            if let Some(end) = find_terminator(&buf) {
                if end > limits.max_bytes {
                    return Err(RouteError::HeaderTooLarge {
                        max: limits.max_bytes,
                    });
                }
                return Ok(end);
            }
            // The head may use all of `max_bytes`; its terminator is extra.
            if buf.len() >= limits.max_bytes + HEADER_TERMINATOR.len() {
                return Err(RouteError::HeaderTooLarge {
                    max: limits.max_bytes,
                });
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(RouteError::ClosedEarly);
            }
        }
    };
    let end = tokio::time::timeout(limits.timeout, accumulate)
        .await
        .map_err(|_| RouteError::HeaderTimeout)??;

    let head = buf.split_to(end);
    buf.advance(HEADER_TERMINATOR.len());
    let mut request = parse_head(&head)?;
    request.leftover = buf.freeze();
    Ok(request)
}

/// Outcome of routing one connection
pub enum Routed<S> {
    Http { stream: S, request: HttpRequest },
    WebSocket(WebSocketConnection),
}

/// Identify the connection and hand off ownership of the socket.
///
/// On a valid upgrade the `101` response is written and the connection is
/// promoted, seeded with any frame bytes that arrived together with the
/// request head. Unreadable requests are answered here (431/400) before the
/// error is returned.
pub async fn route<S>(
    mut stream: S,
    id: ConnectionId,
    config: &ServerConfig,
    observer: Arc<dyn ConnectionObserver>,
) -> Result<Routed<S>, RouteError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let request = match read_request(&mut stream, config.header_limits).await {
        Ok(request) => request,
        Err(err) => {
            let response = match err {
                RouteError::HeaderTooLarge { .. } => {
                    Some(HttpResponse::text(431, "Request Header Fields Too Large", ""))
                }
                RouteError::Malformed(reason) => Some(HttpResponse::text(400, "Bad Request", reason)),
                _ => None,
            };
            if let Some(response) = response {
                let _ = stream.write_all(&response.to_bytes()).await;
                let _ = stream.shutdown().await;
            }
            return Err(err);
        }
    };

    match handshake::negotiate(&request, &config.ws_path) {
        Ok(response) => {
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            info!(
                component = "router",
                event = "ws.handshake.completed",
                connection_id = %id,
                leftover_bytes = request.leftover.len(),
                "WebSocket upgrade accepted"
            );
            Ok(Routed::WebSocket(WebSocketConnection::new(
                id,
                stream,
                request.leftover,
                config.max_message_bytes,
                observer,
            )))
        }
        Err(rejection) => {
            debug!(
                component = "router",
                event = "router.http",
                connection_id = %id,
                method = %request.method,
                path = %request.path,
                reason = %rejection,
                "Routing as plain HTTP"
            );
            Ok(Routed::Http { stream, request })
        }
    }
}
