//! Plain HTTP listener and the HTTP forwarding handler
//!
//! The same handler serves the plain listener (routing by Host header) and
//! connections whose TLS was terminated by the TLS listener (routing by the
//! SNI name the handshake was made for). Every request is resolved against
//! the record store, so route changes apply to the next request.

use crate::config::Timeouts;
use crate::dispatch::{shutdown_signalled, DispatchContext, Stage};
use crate::error::{json_error_response, ErrorCode, GatewayError};
use crate::records::{normalize_routing_key, ListenerClass, ProxyMode, RoutingRecord};
use crate::relay::{relay, Activity, Watched};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on a backend's upgrade response head
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// How requests on a connection find their record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpRoute {
    /// Plain listener: each request is resolved by its Host header
    ByHost,
    /// Terminated TLS: requests follow the record for the SNI name
    Terminated { key: String },
}

impl HttpRoute {
    fn class(&self) -> ListenerClass {
        match self {
            HttpRoute::ByHost => ListenerClass::Http,
            HttpRoute::Terminated { .. } => ListenerClass::Tls,
        }
    }

    fn accepts(&self, mode: ProxyMode) -> bool {
        match self {
            HttpRoute::ByHost => mode == ProxyMode::Plain,
            HttpRoute::Terminated { .. } => mode == ProxyMode::TlsTerminate,
        }
    }

    fn proto(&self) -> &'static str {
        match self {
            HttpRoute::ByHost => "http",
            HttpRoute::Terminated { .. } => "https",
        }
    }
}

/// The plain HTTP proxy listener
pub struct HttpProxyServer {
    listener: TcpListener,
    ctx: DispatchContext,
}

impl HttpProxyServer {
    pub async fn bind(addr: SocketAddr, ctx: DispatchContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP proxy listener on {}: {}", addr, e))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "HTTP proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.ctx.stats.record_accepted();
                            debug!(peer = %peer, stage = Stage::Accepted.as_str(), "HTTP connection");

                            let ctx = self.ctx.clone();
                            self.ctx.tracker.spawn(async move {
                                if let Err(e) = serve_http(stream, peer, ctx, HttpRoute::ByHost).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                                debug!(peer = %peer, stage = Stage::Closed.as_str(), "HTTP connection");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("HTTP proxy shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Server connection builder shared by the proxy and admin listeners.
///
/// HTTP/1 request heads must arrive within the request deadline, which also
/// bounds the wait for the next request on a kept-alive connection.
pub(crate) fn connection_builder(timeouts: &Timeouts) -> AutoBuilder<TokioExecutor> {
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.request())
        .preserve_header_case(true);
    builder
        .http2()
        .timer(TokioTimer::new())
        .max_concurrent_streams(250);
    builder
}

/// Serve HTTP on an accepted (or decrypted) stream until it closes.
///
/// The connection is dropped once no byte has moved for the idle deadline.
/// On shutdown it finishes in-flight requests and then closes.
pub async fn serve_http<S>(
    stream: S,
    peer: SocketAddr,
    ctx: DispatchContext,
    route: HttpRoute,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(Watched::new(stream, Arc::clone(&activity)));
    let mut shutdown_rx = ctx.shutdown.clone();
    let builder = connection_builder(&ctx.timeouts);
    let idle = ctx.timeouts.idle();

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let route = route.clone();
        async move { handle_request(req, ctx, route, peer).await }
    });

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = activity.expired(idle) => {
            debug!(peer = %peer, idle_secs = idle.as_secs(), "Closing idle connection");
            return Ok(());
        }
        _ = shutdown_signalled(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

fn reject(
    ctx: &DispatchContext,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ctx.stats.record_rejected();
    json_error_response(code, message)
}

/// Reject a request whose backend could not be reached; the detail stays in the log
fn reject_upstream(ctx: &DispatchContext, err: GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    ctx.stats.record_upstream_failure();
    ctx.stats.record_rejected();
    err.into_response()
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: DispatchContext,
    route: HttpRoute,
    peer: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let key = match &route {
        HttpRoute::Terminated { key } => key.clone(),
        HttpRoute::ByHost => match extract_hostname(&req) {
            Some(host) => host,
            None => {
                debug!(peer = %peer, request_id, stage = Stage::Rejected.as_str(), "Missing Host");
                return Ok(reject(&ctx, ErrorCode::MissingHost, "Missing or invalid Host header"));
            }
        },
    };
    debug!(key, request_id, stage = Stage::KeyExtracted.as_str(), method = %req.method(), uri = %req.uri(), "Incoming request");

    let record = match ctx.records.resolve(route.class(), &key) {
        Ok(Some(record)) if route.accepts(record.mode) => record,
        Ok(_) => {
            debug!(key, request_id, stage = Stage::Rejected.as_str(), "No route");
            // Don't reveal whether the host exists in another form
            return Ok(reject(&ctx, ErrorCode::NoRoute, "No route for host"));
        }
        Err(e) => {
            error!(key, request_id, error = %e, "Route lookup failed");
            ctx.stats.record_rejected();
            return Ok(e.into_response());
        }
    };
    debug!(key, request_id, record_id = %record.id, backend = %record.target, stage = Stage::Resolved.as_str(), "Route resolved");

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    let forwarded_host = headers
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| HeaderValue::from_str(&key).ok());
    if let Some(host) = forwarded_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(route.proto()));

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, &ctx, &record, &request_id).await);
    }

    let request_timeout = ctx.timeouts.request();
    let result = tokio::time::timeout(request_timeout, ctx.pool.send_request(req, &record.target)).await;

    match result {
        Ok(Ok(mut response)) => {
            ctx.stats.record_forwarded();
            debug!(key, request_id, status = %response.status(), stage = Stage::Forwarding.as_str(), "Response from backend");
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            Ok(response)
        }
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnavailable(format!("{}: {}", record.target, e));
            warn!(key, request_id, error = %err, "Backend request failed");
            Ok(reject_upstream(&ctx, err))
        }
        Err(_) => {
            ctx.stats.record_upstream_failure();
            warn!(
                key,
                backend = %record.target,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Backend request timed out"
            );
            Ok(reject(
                &ctx,
                ErrorCode::UpstreamTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Routing key from the Host header (or the HTTP/2 authority), port stripped
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let host = match raw.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => raw,
    };

    normalize_routing_key(host).ok()
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the backend
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::CONNECTION || name == hyper::header::UPGRADE {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if let Some(upgrade) = req.headers().get(hyper::header::UPGRADE).and_then(|v| v.to_str().ok()) {
        request.push_str(&format!("Upgrade: {}\r\n", upgrade));
    }
    request.push_str("Connection: Upgrade\r\n\r\n");

    request.into_bytes()
}

/// Parsed backend response head plus any bytes read past it
#[derive(Debug)]
struct UpgradeResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    rest: Vec<u8>,
}

fn parse_upgrade_response(data: &[u8]) -> Option<UpgradeResponse> {
    let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some(UpgradeResponse {
        status,
        headers,
        rest: data[head_end + 4..].to_vec(),
    })
}

async fn read_upgrade_response(backend: &mut TcpStream) -> std::io::Result<Option<UpgradeResponse>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(parsed) = parse_upgrade_response(&buf) {
            return Ok(Some(parsed));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Ok(None);
        }
    }
}

fn empty_response(builder: hyper::http::response::Builder) -> Response<BoxBody<Bytes, hyper::Error>> {
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| json_error_response(ErrorCode::UpstreamUnavailable, "Invalid backend response"))
}

/// Relay an HTTP/1.1 upgrade (WebSocket) to the record's target
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: &DispatchContext,
    record: &RoutingRecord,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let backend_addr = record.target.clone();
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(backend = %backend_addr, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req);

    let mut backend = match tokio::time::timeout(ctx.timeouts.connect(), TcpStream::connect(&backend_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnavailable(format!("{}: {}", backend_addr, e));
            warn!(request_id, error = %err, "Failed to connect to backend for upgrade");
            return reject_upstream(ctx, err);
        }
        Err(_) => {
            let err = GatewayError::UpstreamUnavailable(format!("{}: connect timed out", backend_addr));
            warn!(request_id, error = %err, "Backend connect timed out");
            return reject_upstream(ctx, err);
        }
    };

    let exchange = async {
        backend.write_all(&raw_request).await?;
        read_upgrade_response(&mut backend).await
    };
    let parsed = match tokio::time::timeout(ctx.timeouts.request(), exchange).await {
        Ok(Ok(Some(parsed))) => parsed,
        Ok(Ok(None)) | Ok(Err(_)) => {
            let err = GatewayError::UpstreamUnavailable(format!("{}: no valid upgrade response", backend_addr));
            warn!(request_id, error = %err, "Invalid or missing upgrade response from backend");
            return reject_upstream(ctx, err);
        }
        Err(_) => {
            ctx.stats.record_upstream_failure();
            return reject(ctx, ErrorCode::UpstreamTimeout, "Upgrade timed out");
        }
    };

    if parsed.status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(backend = %backend_addr, status = %parsed.status, "Backend declined upgrade");
        ctx.stats.record_forwarded();
        let mut response = Response::builder().status(parsed.status);
        for (name, value) in &parsed.headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return empty_response(response);
    }

    info!(backend = %backend_addr, request_id, upgrade_type, "Upgrade accepted by backend");
    ctx.stats.record_forwarded();

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &parsed.headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let idle = ctx.timeouts.idle();
    let request_id = request_id.to_string();
    let leftover = parsed.rest;
    ctx.tracker.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                match relay(&mut client, &mut backend, idle).await {
                    Ok(stats) => debug!(
                        backend = %backend_addr,
                        request_id,
                        client_to_backend = stats.client_to_backend,
                        backend_to_client = stats.backend_to_client,
                        stage = Stage::Closed.as_str(),
                        "Upgraded connection closed"
                    ),
                    Err(e) => debug!(backend = %backend_addr, request_id, error = %e, "Upgraded connection ended with error"),
                }
            }
            Err(e) => {
                warn!(backend = %backend_addr, request_id, error = %e, "Client upgrade failed");
            }
        }
    });

    empty_response(response)
}
