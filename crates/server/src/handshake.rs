//! WebSocket upgrade negotiation.
//!
//! Decides whether a parsed request is a valid upgrade and builds the
//! `101 Switching Protocols` response. A rejection is not an error: the
//! router falls back to plain HTTP handling.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use thiserror::Error;

use crate::router::HttpRequest;

/// Fixed GUID appended to the client key (RFC 6455 §1.3).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why a request is not a WebSocket upgrade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeRejection {
    #[error("method {0} is not GET")]
    Method(String),

    #[error("path {0} is not the upgrade path")]
    Path(String),

    #[error("missing `Upgrade: websocket` header")]
    MissingUpgrade,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// `base64(SHA1(key + GUID))`
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WEBSOCKET_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WEBSOCKET_GUID);
    BASE64.encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes()).as_ref())
}

/// Validate an upgrade request against `ws_path` and return the response
/// bytes to write before switching protocols.
pub fn negotiate(request: &HttpRequest, ws_path: &str) -> Result<String, HandshakeRejection> {
    if request.path != ws_path {
        return Err(HandshakeRejection::Path(request.path.clone()));
    }
    if request.method != "GET" {
        return Err(HandshakeRejection::Method(request.method.clone()));
    }
    let upgrade = request
        .header("upgrade")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
        .unwrap_or(false);
    if !upgrade {
        return Err(HandshakeRejection::MissingUpgrade);
    }
    let key = request
        .header("sec-websocket-key")
        .filter(|key| !key.trim().is_empty())
        .ok_or(HandshakeRejection::MissingKey)?;

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::parse_head;

    fn request(head: &str) -> HttpRequest {
        parse_head(head.as_bytes()).expect("valid request head")
    }

    #[test]
    fn rfc_example_key_produces_expected_accept() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_upgrade_yields_switching_protocols() {
        let req = request(
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13",
        );
        let response = negotiate(&req, "/ws").unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn query_string_does_not_affect_path_match() {
        let req = request(
            "GET /ws?run=1 HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc=",
        );
        assert!(negotiate(&req, "/ws").is_ok());
    }

    #[test]
    fn non_upgrade_requests_are_rejected_not_failed() {
        let post = request("POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: a");
        assert_eq!(
            negotiate(&post, "/ws"),
            Err(HandshakeRejection::Method("POST".into()))
        );

        let other_path =
            request("GET /api/notify HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: a");
        assert!(matches!(
            negotiate(&other_path, "/ws"),
            Err(HandshakeRejection::Path(_))
        ));

        let no_upgrade = request("GET /ws HTTP/1.1\r\nSec-WebSocket-Key: a");
        assert_eq!(
            negotiate(&no_upgrade, "/ws"),
            Err(HandshakeRejection::MissingUpgrade)
        );

        let no_key = request("GET /ws HTTP/1.1\r\nUpgrade: websocket");
        assert_eq!(
            negotiate(&no_key, "/ws"),
            Err(HandshakeRejection::MissingKey)
        );
    }
}
