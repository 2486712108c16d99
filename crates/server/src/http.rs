//! Plain HTTP endpoints served on the same port as the WebSocket upgrade.
//!
//! One request per connection; every response carries `Connection: close`.
//!
//! - `GET  /health`                       liveness probe
//! - `POST /api/notify`                   legacy one-shot notification (opaque JSON)
//! - `GET  /api/sessions`                 session list snapshot
//! - `POST /api/sessions/{id}/dismiss`    remove a closed session
//! - `POST /api/sessions/{id}/select`     change the observer selection

use std::time::Duration;

use agentscope_protocol::ConnectionId;
use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::registry::DismissOutcome;
use crate::registry_actor::RegistryHandle;
use crate::router::{HttpRequest, RouteError};

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn empty(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            content_type: "text/plain; charset=utf-8",
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, reason: &'static str, body: &str) -> Self {
        Self {
            body: body.as_bytes().to_vec(),
            ..Self::empty(status, reason)
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status: 200,
                reason: "OK",
                content_type: "application/json",
                body,
            },
            Err(e) => {
                warn!(
                    component = "http",
                    event = "http.serialize_failed",
                    error = %e,
                    "Failed to serialize response"
                );
                Self::empty(500, "Internal Server Error")
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason,
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read the request body announced by `Content-Length`, starting from the
/// bytes that arrived with the head.
async fn read_body<S>(
    stream: &mut S,
    request: &mut HttpRequest,
    timeout: Duration,
) -> Result<(), HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let Some(length) = request.header("content-length") else {
        return Err(HttpResponse::empty(411, "Length Required"));
    };
    let length: usize = length
        .trim()
        .parse()
        .map_err(|_| HttpResponse::text(400, "Bad Request", "invalid Content-Length"))?;
    if length > MAX_BODY_BYTES {
        return Err(HttpResponse::empty(413, "Payload Too Large"));
    }

    let mut body = BytesMut::from(&request.leftover[..]);
    let fill = async {
        while body.len() < length {
            if stream.read_buf(&mut body).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
        }
        Ok(())
    };
    match tokio::time::timeout(timeout, fill).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err(HttpResponse::text(400, "Bad Request", "truncated body")),
        Err(_) => return Err(HttpResponse::empty(408, "Request Timeout")),
    }
    body.truncate(length);
    request.body = body.freeze();
    Ok(())
}

fn parse_session_id(raw: &str) -> Option<ConnectionId> {
    raw.parse::<u64>().ok().map(ConnectionId)
}

async fn dispatch(
    request: &HttpRequest,
    config: &ServerConfig,
    registry: &RegistryHandle,
) -> HttpResponse {
    if request.path == config.ws_path {
        return if request.method == "GET" {
            HttpResponse::text(400, "Bad Request", "invalid WebSocket upgrade request")
        } else {
            HttpResponse::empty(405, "Method Not Allowed")
        };
    }

    let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => HttpResponse::text(200, "OK", "OK"),
        ("GET", ["api", "sessions"]) => HttpResponse::json(&*registry.snapshot()),
        ("POST", ["api", "notify"]) => match serde_json::from_slice::<Value>(&request.body) {
            Ok(payload) => {
                registry.notify(payload).await;
                HttpResponse::empty(204, "No Content")
            }
            Err(e) => {
                debug!(
                    component = "http",
                    event = "http.notify.parse_failed",
                    error = %e,
                    "Notification body is not JSON"
                );
                HttpResponse::text(400, "Bad Request", "body must be JSON")
            }
        },
        ("POST", ["api", "sessions", id, "dismiss"]) => {
            let Some(id) = parse_session_id(id) else {
                return HttpResponse::empty(404, "Not Found");
            };
            match registry.dismiss(id).await {
                DismissOutcome::Dismissed => HttpResponse::empty(204, "No Content"),
                DismissOutcome::StillActive => {
                    HttpResponse::text(409, "Conflict", "session is still active")
                }
                DismissOutcome::NotFound => HttpResponse::empty(404, "Not Found"),
            }
        }
        ("POST", ["api", "sessions", id, "select"]) => {
            let Some(id) = parse_session_id(id) else {
                return HttpResponse::empty(404, "Not Found");
            };
            if registry.select(Some(id)).await {
                HttpResponse::empty(204, "No Content")
            } else {
                HttpResponse::empty(404, "Not Found")
            }
        }
        (_, ["health"])
        | (_, ["api", "notify"])
        | (_, ["api", "sessions"])
        | (_, ["api", "sessions", _, "dismiss" | "select"]) => {
            HttpResponse::empty(405, "Method Not Allowed")
        }
        _ => HttpResponse::empty(404, "Not Found"),
    }
}

/// Answer one plain HTTP request and close the connection.
pub async fn respond<S>(
    stream: &mut S,
    mut request: HttpRequest,
    config: &ServerConfig,
    registry: &RegistryHandle,
) -> Result<u16, RouteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Only notify carries a payload; the session actions ignore any body.
    let body_result = if request.method == "POST" && request.path == "/api/notify" {
        read_body(stream, &mut request, config.header_limits.timeout).await
    } else {
        Ok(())
    };
    let response = match body_result {
        Ok(()) => dispatch(&request, config, registry).await,
        Err(response) => response,
    };

    debug!(
        component = "http",
        event = "http.response",
        method = %request.method,
        path = %request.path,
        status = response.status,
        "HTTP request handled"
    );
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(response.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::read_request;

    async fn roundtrip(raw: &str, registry: &RegistryHandle) -> (u16, String) {
        let config = ServerConfig::default();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(raw.as_bytes()).await.unwrap();

        let request = read_request(&mut server, config.header_limits).await.unwrap();
        let status = respond(&mut server, request, &config, registry)
            .await
            .unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        (status, out)
    }

    #[tokio::test]
    async fn health_check() {
        let registry = RegistryHandle::spawn();
        let (status, out) = roundtrip("GET /health HTTP/1.1\r\n\r\n", &registry).await;
        assert_eq!(status, 200);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nOK"));
    }

    #[tokio::test]
    async fn notify_forwards_json_to_observers() {
        let registry = RegistryHandle::spawn();
        let mut rx = registry.subscribe();
        let body = r#"{"title":"run finished"}"#;
        let raw = format!(
            "POST /api/notify HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (status, _) = roundtrip(&raw, &registry).await;
        assert_eq!(status, 204);
        assert_eq!(
            rx.recv().await.unwrap(),
            agentscope_protocol::ObserverEvent::Notification {
                payload: serde_json::json!({"title": "run finished"})
            }
        );
    }

    #[tokio::test]
    async fn notify_rejects_bad_bodies() {
        let registry = RegistryHandle::spawn();
        let (status, _) = roundtrip(
            "POST /api/notify HTTP/1.1\r\nContent-Length: 4\r\n\r\nnope",
            &registry,
        )
        .await;
        assert_eq!(status, 400);

        let (status, _) = roundtrip("POST /api/notify HTTP/1.1\r\n\r\n", &registry).await;
        assert_eq!(status, 411);

        let (status, _) = roundtrip(
            "POST /api/notify HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n",
            &registry,
        )
        .await;
        assert_eq!(status, 413);
    }

    #[tokio::test]
    async fn failed_upgrade_on_ws_path_is_a_bad_request() {
        let registry = RegistryHandle::spawn();
        let (status, _) = roundtrip("GET /ws HTTP/1.1\r\nHost: x\r\n\r\n", &registry).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let registry = RegistryHandle::spawn();
        let (status, _) = roundtrip("GET /nowhere HTTP/1.1\r\n\r\n", &registry).await;
        assert_eq!(status, 404);
        let (status, _) = roundtrip("DELETE /health HTTP/1.1\r\n\r\n", &registry).await;
        assert_eq!(status, 405);
    }

    #[tokio::test]
    async fn session_routes_reflect_registry_state() {
        use crate::connection::ConnectionObserver;

        let registry = RegistryHandle::spawn();
        let id = ConnectionId(5);
        registry
            .on_message(id, r#"{"type":"session_info","command":"agent"}"#.into())
            .await;
        // Round-trip through the actor so the snapshot is current.
        registry.messages(id).await;

        let (status, out) = roundtrip("GET /api/sessions HTTP/1.1\r\n\r\n", &registry).await;
        assert_eq!(status, 200);
        assert!(out.contains(r#""command":"agent""#));

        let dismiss = "POST /api/sessions/5/dismiss HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let (status, _) = roundtrip(dismiss, &registry).await;
        assert_eq!(status, 409);

        registry.on_disconnect(id).await;
        let (status, _) = roundtrip(dismiss, &registry).await;
        assert_eq!(status, 204);
        let (status, _) = roundtrip(dismiss, &registry).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn session_actions_need_no_content_length() {
        use crate::connection::ConnectionObserver;

        let registry = RegistryHandle::spawn();
        let id = ConnectionId(6);
        registry
            .on_message(id, r#"{"type":"session_info","command":"agent"}"#.into())
            .await;
        registry.on_disconnect(id).await;

        let (status, _) = roundtrip(
            "POST /api/sessions/6/select HTTP/1.1\r\nHost: x\r\n\r\n",
            &registry,
        )
        .await;
        assert_eq!(status, 204);

        let (status, _) = roundtrip(
            "POST /api/sessions/6/dismiss HTTP/1.1\r\nHost: x\r\n\r\n",
            &registry,
        )
        .await;
        assert_eq!(status, 204);
        assert!(registry.snapshot().sessions.is_empty());
    }
}
