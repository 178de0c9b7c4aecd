//! The single route from the public listener to the backend

use crate::config::Config;
use crate::rewrite::RewriteRule;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::http::uri::Authority;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Where requests are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// host:port, as used for the Host header and for dialing
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Absolute URI for a request path on this upstream
    pub fn uri_for(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.authority(), path_and_query)
    }

    /// Check whether something is listening on the upstream address
    pub async fn probe(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(self.authority())).await,
            Ok(Ok(_))
        )
    }
}

/// Binding of a path prefix to the upstream, with the per-response steps
/// applied on the way back.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub upstream: Upstream,
    /// `None` when redirect rewriting is disabled
    pub rewrite: Option<RewriteRule>,
    pub change_origin: bool,
    pub websocket: bool,
    pub forwarded_headers: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Route {
    /// The root route described by `config`
    pub fn from_config(config: &Config) -> Self {
        let rewrite = config.rewrite.enabled.then(|| {
            let rule = RewriteRule::new(config.upstream.port, config.server.public_address());
            match &config.rewrite.protocol {
                Some(protocol) => rule.with_protocol(protocol.clone()),
                None => rule,
            }
        });

        Self {
            prefix: "/".to_string(),
            upstream: Upstream::new(config.upstream.host.clone(), config.upstream.port),
            rewrite,
            change_origin: config.upstream.change_origin,
            websocket: config.upstream.websocket,
            forwarded_headers: config.upstream.forwarded_headers,
            connect_timeout: config.upstream.connect_timeout(),
            request_timeout: config.upstream.request_timeout(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Adjust inbound request headers before they are sent upstream.
    ///
    /// With `change_origin` the Host header names the backend, so the request
    /// looks to it as if it had been addressed directly. Without it the
    /// client's Host is kept. HTTP/2 clients send no Host, so the request
    /// authority stands in for it; the backend authority is the last resort.
    pub fn prepare_request_headers(
        &self,
        headers: &mut HeaderMap,
        authority: Option<&Authority>,
        client_addr: SocketAddr,
    ) {
        let original_host = headers.get(HOST).cloned().or_else(|| {
            authority.and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        // Overwritten, not appended: this proxy is the first hop.
        if self.forwarded_headers {
            if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
            if let Some(host) = original_host.clone() {
                headers.insert(X_FORWARDED_HOST, host);
            }
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        match original_host {
            Some(host) if !self.change_origin => {
                headers.insert(HOST, host);
            }
            _ => {
                if let Ok(value) = HeaderValue::from_str(&self.upstream.authority()) {
                    headers.insert(HOST, value);
                }
            }
        }
    }
}
