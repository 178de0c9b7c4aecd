//! Protocol upgrade (WebSocket) tunneling
//!
//! The client's handshake is replayed on a fresh backend connection. If the
//! backend answers `101 Switching Protocols`, both sides are upgraded and
//! bytes are copied between them untouched until either end closes. Any other
//! answer is relayed to the client as an ordinary response.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::route::Route;
use crate::session::{ProxySession, SessionBody, SessionState};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Errors raised while setting up a tunnel
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with backend failed: {0}")]
    Handshake(#[from] hyper::Error),
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

/// Check if a request asks for a protocol upgrade.
///
/// Requires both an `Upgrade` header and the `upgrade` token in `Connection`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    has_upgrade_connection && headers.contains_key(UPGRADE)
}

/// Get the value of the Upgrade header
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Handle an upgrade request whose headers have already been prepared for
/// the backend.
pub async fn handle_upgrade(
    mut req: Request<Incoming>,
    route: Arc<Route>,
    mut session: ProxySession,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let protocol = upgrade_protocol(req.headers()).unwrap_or_else(|| "unknown".to_string());
    let request_id = session.request_id().to_string();
    debug!(request_id, protocol, uri = %req.uri(), "Handling upgrade request");

    let mut sender = match connect(&route).await {
        Ok(sender) => sender,
        Err(e) => {
            error!(request_id, upstream = %route.upstream.authority(), error = %e, "Upgrade failed before handshake");
            session.close("backend unreachable");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Failed to connect to backend",
            ));
        }
    };

    let upstream_req = match build_upstream_request(&req) {
        Ok(r) => r,
        Err(e) => {
            error!(request_id, error = %e, "Failed to build upgrade request");
            session.close("request build error");
            return Ok(json_error_response(ProxyErrorCode::InternalError, "Invalid upgrade request"));
        }
    };

    let mut response = match tokio::time::timeout(route.request_timeout, sender.send_request(upstream_req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(request_id, error = %e, "Backend failed the upgrade handshake");
            session.close("handshake error");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Backend failed the upgrade handshake",
            ));
        }
        Err(_) => {
            warn!(request_id, timeout_secs = route.request_timeout.as_secs(), "Upgrade handshake timed out");
            session.close("timeout");
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Backend did not answer the upgrade within {} seconds",
                    route.request_timeout.as_secs()
                ),
            ));
        }
    };

    session.advance(SessionState::Forwarding);

    if let Some(rule) = &route.rewrite {
        rule.apply(response.headers_mut());
    }

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %response.status(), "Backend rejected upgrade request");
        let (mut parts, body) = response.into_parts();
        parts.headers.remove(CONNECTION);
        parts.headers.remove(TRANSFER_ENCODING);
        let body = SessionBody::new(body.boxed(), session).boxed();
        return Ok(Response::from_parts(parts, body));
    }

    info!(request_id, protocol, "Upgrade accepted by backend");

    let backend_upgrade = hyper::upgrade::on(&mut response);
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut client_response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *client_response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    for (name, value) in response.headers() {
        // hyper frames the 101 itself
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        client_response.headers_mut().append(name.clone(), value.clone());
    }

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client, backend)) => {
                session.advance(SessionState::Tunneling);
                tunnel(client, backend, &request_id).await;
                session.close("tunnel closed");
            }
            Err(e) => {
                debug!(request_id, error = %e, "Upgrade did not complete");
                session.close("upgrade error");
            }
        }
    });

    Ok(client_response)
}

async fn connect(route: &Route) -> Result<http1::SendRequest<Empty<Bytes>>, UpgradeError> {
    let addr = route.upstream.authority();
    let stream = tokio::time::timeout(route.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| UpgradeError::ConnectTimeout(addr.clone()))?
        .map_err(|source| UpgradeError::Connect {
            addr: addr.clone(),
            source,
        })?;
    let _ = stream.set_nodelay(true);

    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Backend upgrade connection error");
        }
    });

    Ok(sender)
}

/// Replay the client's handshake for the backend: same method, path and
/// headers, no body. Body framing headers are dropped with the body.
fn build_upstream_request<B>(req: &Request<B>) -> Result<Request<Empty<Bytes>>, UpgradeError> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut builder = Request::builder().method(req.method().clone()).uri(path);

    for (name, value) in req.headers() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Empty::new())
        .map_err(|e| UpgradeError::RequestBuild(e.to_string()))
}

/// Copy bytes in both directions until either side closes
async fn tunnel(client: Upgraded, backend: Upgraded, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend,
                backend_to_client,
                "Tunnel closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Tunnel closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_websocket_handshake_is_upgrade() {
        let h = headers(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        assert!(is_upgrade_request(&h));
        assert_eq!(upgrade_protocol(&h).as_deref(), Some("websocket"));
    }

    #[test]
    fn test_connection_token_list() {
        let h = headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "WebSocket")]);
        assert!(is_upgrade_request(&h));
        assert_eq!(upgrade_protocol(&h).as_deref(), Some("websocket"));
    }

    #[test]
    fn test_upgrade_header_alone_is_not_enough() {
        let h = headers(&[("upgrade", "websocket")]);
        assert!(!is_upgrade_request(&h));

        let h = headers(&[("connection", "upgrade")]);
        assert!(!is_upgrade_request(&h));

        let h = headers(&[("connection", "keep-alive"), ("upgrade", "websocket")]);
        assert!(!is_upgrade_request(&h));
    }

    #[test]
    fn test_replayed_handshake_drops_body_framing() {
        let req = Request::builder()
            .method("GET")
            .uri("/ws?room=1")
            .header("host", "127.0.0.1:56294")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("content-length", "12")
            .header("transfer-encoding", "chunked")
            .body(())
            .unwrap();

        let upstream = build_upstream_request(&req).unwrap();

        assert_eq!(upstream.uri(), "/ws?room=1");
        assert!(is_upgrade_request(upstream.headers()));
        assert_eq!(upstream.headers().get("host").unwrap(), "127.0.0.1:56294");
        assert_eq!(
            upstream.headers().get("sec-websocket-key").unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
        assert!(!upstream.headers().contains_key(CONTENT_LENGTH));
        assert!(!upstream.headers().contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn test_token_must_match_exactly() {
        let h = headers(&[("connection", "upgraded-later"), ("upgrade", "websocket")]);
        assert!(!is_upgrade_request(&h));
    }
}
