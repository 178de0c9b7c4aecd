use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{strip_hop_by_hop, ConnectionPool, PoolConfig};
use crate::route::Route;
use crate::session::{ProxySession, SessionBody, SessionState};
use crate::upgrade::{handle_upgrade, is_upgrade_request};
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
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

/// The public-facing proxy listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    route: Arc<Route>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Build the server described by a loaded configuration
    pub fn from_config(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            connect_timeout: config.upstream.connect_timeout(),
        };
        Ok(Self {
            bind_addr: config.server.listen_addr()?,
            route: Arc::new(Route::from_config(config)),
            pool: Arc::new(ConnectionPool::new(pool_config)),
            shutdown_rx,
        })
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    /// Get the connection pool (for request statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Bind the listening socket. Fails if the address is already in use.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", self.bind_addr))
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            upstream = %self.route.upstream.authority(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let route = Arc::clone(&self.route);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, route, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    route: Arc<Route>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let route = Arc::clone(&route);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, route, pool, addr).await }
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
    route: Arc<Route>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Only used to correlate log lines; never injected upstream
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if !route.matches(req.uri().path()) {
        debug!(request_id, uri = %req.uri(), "No route for request");
        return Ok(json_error_response(ProxyErrorCode::NoRoute, "No route for request"));
    }

    let upgrade = route.websocket && is_upgrade_request(req.headers());
    let authority = req.uri().authority().cloned();
    route.prepare_request_headers(req.headers_mut(), authority.as_ref(), client_addr);

    debug!(method = %req.method(), uri = %req.uri(), upgrade, request_id, "Incoming request");

    let session = ProxySession::new(request_id);

    if upgrade {
        return handle_upgrade(req, route, session).await;
    }

    strip_hop_by_hop(req.headers_mut());
    forward(req, route, pool, session).await
}

async fn forward(
    req: Request<Incoming>,
    route: Arc<Route>,
    pool: Arc<ConnectionPool>,
    mut session: ProxySession,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = tokio::time::timeout(route.request_timeout, pool.send_request(req, &route.upstream)).await;

    match result {
        Ok(Ok(response)) => {
            session.advance(SessionState::Forwarding);
            let (mut parts, body) = response.into_parts();

            if let Some(rule) = &route.rewrite {
                rule.apply(&mut parts.headers);
            }

            debug!(
                request_id = %session.request_id(),
                method = %method,
                path,
                status = parts.status.as_u16(),
                "Forwarding response"
            );

            let body = SessionBody::new(body, session).boxed();
            Ok(Response::from_parts(parts, body))
        }
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(
                request_id = %session.request_id(),
                upstream = %route.upstream.authority(),
                method = %method,
                path,
                error = %e,
                "Failed to forward request"
            );
            session.close("backend error");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                request_id = %session.request_id(),
                method = %method,
                path,
                timeout_secs = route.request_timeout.as_secs(),
                "Request timed out"
            );
            session.close("timeout");
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    route.request_timeout.as_secs()
                ),
            ))
        }
    }
}
