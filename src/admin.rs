//! Admin listener: the control API and the operator console, TLS only
//!
//! Requests under `/api/` go to [`ControlApi`]. `GET /health` and
//! `GET /version` answer without authentication, and any other GET is served
//! from the configured console directory.

use crate::api::ControlApi;
use crate::certs::{generate_self_signed, load_certs, load_key, server_config};
use crate::config::{AdminConfig, Timeouts};
use crate::dispatch::shutdown_signalled;
use crate::error::{json_error_response, ErrorCode};
use crate::proxy::connection_builder;
use crate::relay::{Activity, Watched};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type AdminResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// TLS config for the admin listener.
///
/// Uses the configured cert/key pair, or a self-signed certificate for
/// `localhost` when none is configured.
pub fn admin_tls_config(config: &AdminConfig) -> anyhow::Result<Arc<ServerConfig>> {
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(Path::new(cert))?;
            let key = load_key(Path::new(key))?;
            info!(cert = %cert, "Loaded admin certificate");
            server_config(certs, key)
        }
        _ => {
            warn!("No admin certificate configured, using a self-signed certificate");
            let (certs, key) = generate_self_signed(vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ])?;
            server_config(certs, key)
        }
    }
}

/// Console assets served from a directory
#[derive(Debug, Clone)]
pub struct StaticAssets {
    root: PathBuf,
}

impl StaticAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto a file below the root. `None` for traversal attempts.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        if relative.contains('\\') || relative.contains('\0') {
            return None;
        }

        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }

        if relative.is_empty() || relative.ends_with('/') || path.is_dir() {
            path.push("index.html");
        }
        Some(path)
    }

    async fn serve(&self, request_path: &str) -> AdminResponse {
        let Some(path) = self.resolve(request_path) else {
            warn!(path = request_path, "Rejected console path");
            return json_error_response(ErrorCode::NotFound, "Resource not found");
        };

        match tokio::fs::read(&path).await {
            Ok(contents) => response(StatusCode::OK, content_type_for(&path), contents),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Console asset unavailable");
                json_error_response(ErrorCode::NotFound, "Resource not found")
            }
        }
    }
}

/// Content type by file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Route one admin request
pub async fn handle_admin_request<B>(
    req: Request<B>,
    api: &ControlApi,
    assets: Option<&StaticAssets>,
) -> AdminResponse
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();

    if path == "/api" || path.starts_with("/api/") {
        return api.handle(req).await;
    }

    match (req.method(), path.as_str()) {
        // Health check for the admin listener itself
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            response(StatusCode::OK, "application/json", version_info.to_string())
        }

        (&Method::GET, _) => match assets {
            Some(assets) => assets.serve(&path).await,
            None => json_error_response(ErrorCode::NotFound, "Resource not found"),
        },

        _ => json_error_response(ErrorCode::NotFound, "Resource not found"),
    }
}

/// The admin listener
pub struct AdminServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    api: ControlApi,
    assets: Option<StaticAssets>,
    timeouts: Timeouts,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<ServerConfig>,
        api: ControlApi,
        static_dir: Option<PathBuf>,
        timeouts: Timeouts,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin listener on {}: {}", addr, e))?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            api,
            assets: static_dir.map(StaticAssets::new),
            timeouts,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Admin API listening (HTTPS)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let api = Arc::new(self.api);
        let assets = Arc::new(self.assets);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let acceptor = self.acceptor.clone();
                            let api = Arc::clone(&api);
                            let assets = Arc::clone(&assets);
                            let timeouts = self.timeouts.clone();
                            let shutdown_rx = self.shutdown_rx.clone();

                            tokio::spawn(async move {
                                match tokio::time::timeout(timeouts.handshake(), acceptor.accept(stream)).await {
                                    Ok(Ok(tls_stream)) => {
                                        if let Err(e) = serve_admin_connection(tls_stream, peer, api, assets, timeouts, shutdown_rx).await {
                                            debug!(peer = %peer, error = %e, "Admin connection error");
                                        }
                                    }
                                    Ok(Err(e)) => {
                                        debug!(peer = %peer, error = %e, "Admin TLS handshake failed");
                                    }
                                    Err(_) => {
                                        debug!(peer = %peer, "Admin TLS handshake timed out");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    peer: SocketAddr,
    api: Arc<ControlApi>,
    assets: Arc<Option<StaticAssets>>,
    timeouts: Timeouts,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(Watched::new(stream, Arc::clone(&activity)));
    let builder = connection_builder(&timeouts);
    let idle = timeouts.idle();
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let api = Arc::clone(&api);
        let assets = Arc::clone(&assets);
        async move {
            let started = Instant::now();
            let method = req.method().clone();
            let path = req.uri().path().to_string();

            let resp = handle_admin_request(req, &api, (*assets).as_ref()).await;

            info!(
                peer = %peer,
                %method,
                %path,
                status = resp.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Admin request"
            );
            Ok::<_, hyper::Error>(resp)
        }
    });

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = activity.expired(idle) => {
            debug!(peer = %peer, idle_secs = idle.as_secs(), "Closing idle admin connection");
            return Ok(());
        }
        _ = shutdown_signalled(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    result.map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))
}
