//! TLS proxy listener
//!
//! Peeks the ClientHello to learn the server name, resolves it among the
//! TLS-class records and then either relays the untouched bytes to the
//! backend (passthrough) or completes the handshake with the record's
//! certificate and serves the decrypted HTTP (termination). Connections
//! without a usable server name or route are closed without a response.

use crate::certs::CertificateStore;
use crate::dispatch::{shutdown_signalled, DispatchContext, Stage};
use crate::error::GatewayError;
use crate::proxy::{serve_http, HttpRoute};
use crate::records::{ListenerClass, ProxyMode, RoutingRecord};
use crate::relay::{relay, Prebuffered};
use crate::sni::{SniConfig, SniInspector, SniResult, MAX_CLIENT_HELLO_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub struct TlsProxyServer {
    listener: TcpListener,
    ctx: DispatchContext,
    certs: Arc<CertificateStore>,
    inspector: SniInspector,
}

impl TlsProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        ctx: DispatchContext,
        certs: Arc<CertificateStore>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind TLS proxy listener on {}: {}", addr, e))?;
        let inspector = SniInspector::with_config(SniConfig {
            timeout: ctx.timeouts.sni(),
            max_bytes: MAX_CLIENT_HELLO_BYTES,
        });
        Ok(Self {
            listener,
            ctx,
            certs,
            inspector,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "TLS proxy listening (SNI routing)");

        let mut shutdown_rx = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.ctx.stats.record_accepted();
                            debug!(peer = %peer, stage = Stage::Accepted.as_str(), "TLS connection");

                            let ctx = self.ctx.clone();
                            let certs = Arc::clone(&self.certs);
                            let inspector = self.inspector.clone();
                            self.ctx.tracker.spawn(async move {
                                handle_connection(stream, peer, ctx, certs, inspector).await;
                                debug!(peer = %peer, stage = Stage::Closed.as_str(), "TLS connection");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("TLS proxy shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: DispatchContext,
    certs: Arc<CertificateStore>,
    inspector: SniInspector,
) {
    let (result, client_hello) = inspector.inspect(&mut stream).await;

    let key = match result {
        SniResult::Found(name) => name,
        SniResult::Timeout => {
            ctx.stats.record_rejected();
            warn!(peer = %peer, stage = Stage::Rejected.as_str(), "ClientHello not received in time");
            return;
        }
        other => {
            // No default route is ever guessed
            ctx.stats.record_rejected();
            debug!(peer = %peer, result = ?other, stage = Stage::Rejected.as_str(), "No usable SNI");
            return;
        }
    };
    debug!(peer = %peer, key, stage = Stage::KeyExtracted.as_str(), "SNI extracted");

    let record = match ctx.records.resolve(ListenerClass::Tls, &key) {
        Ok(Some(record)) => record,
        Ok(None) => {
            ctx.stats.record_rejected();
            debug!(peer = %peer, key, stage = Stage::Rejected.as_str(), "No route");
            return;
        }
        Err(e) => {
            ctx.stats.record_rejected();
            error!(peer = %peer, key, error = %e, "Route lookup failed");
            return;
        }
    };
    debug!(
        peer = %peer,
        key,
        record_id = %record.id,
        mode = %record.mode,
        stage = Stage::Resolved.as_str(),
        "Route resolved"
    );

    match record.mode {
        ProxyMode::TlsPassthrough => passthrough(stream, client_hello, peer, &ctx, &record).await,
        ProxyMode::TlsTerminate => terminate(stream, client_hello, peer, ctx, certs, record, key).await,
        ProxyMode::Plain => {
            ctx.stats.record_rejected();
            warn!(key, record_id = %record.id, "Plain record in TLS class");
        }
    }
}

/// Relay the original bytes, ClientHello included, to the backend
async fn passthrough(
    mut client: TcpStream,
    client_hello: Vec<u8>,
    peer: SocketAddr,
    ctx: &DispatchContext,
    record: &RoutingRecord,
) {
    let mut backend =
        match tokio::time::timeout(ctx.timeouts.connect(), TcpStream::connect(&record.target)).await {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                let err = GatewayError::UpstreamUnavailable(format!("{}: {}", record.target, e));
                reject_passthrough(ctx, peer, err);
                return;
            }
            Err(_) => {
                let err = GatewayError::UpstreamUnavailable(format!("{}: connect timed out", record.target));
                reject_passthrough(ctx, peer, err);
                return;
            }
        };
    let _ = backend.set_nodelay(true);

    if let Err(e) = backend.write_all(&client_hello).await {
        ctx.stats.record_upstream_failure();
        warn!(peer = %peer, backend = %record.target, error = %e, "Failed to replay ClientHello");
        return;
    }

    ctx.stats.record_forwarded();
    debug!(peer = %peer, backend = %record.target, stage = Stage::Forwarding.as_str(), "Passthrough relay started");

    match relay(&mut client, &mut backend, ctx.timeouts.idle()).await {
        Ok(stats) => debug!(
            peer = %peer,
            client_to_backend = stats.client_to_backend + client_hello.len() as u64,
            backend_to_client = stats.backend_to_client,
            "Passthrough relay finished"
        ),
        Err(e) => debug!(peer = %peer, error = %e, "Passthrough relay ended with error"),
    }
}

/// Passthrough clients get no response; closing the connection is the gateway failure
fn reject_passthrough(ctx: &DispatchContext, peer: SocketAddr, err: GatewayError) {
    ctx.stats.record_upstream_failure();
    ctx.stats.record_rejected();
    warn!(peer = %peer, error = %err, code = err.code().as_header_value(), stage = Stage::Rejected.as_str(), "Backend unreachable");
}

/// Handshake with the record's certificate, then serve decrypted HTTP
async fn terminate(
    client: TcpStream,
    client_hello: Vec<u8>,
    peer: SocketAddr,
    ctx: DispatchContext,
    certs: Arc<CertificateStore>,
    record: RoutingRecord,
    key: String,
) {
    let Some(cert_ref) = record.certificate.as_deref() else {
        ctx.stats.record_rejected();
        warn!(key, record_id = %record.id, "tls-terminate record without certificate");
        return;
    };

    let config = match certs.server_config(cert_ref) {
        Ok(config) => config,
        Err(e) => {
            ctx.stats.record_rejected();
            error!(key, certificate = cert_ref, error = %e, stage = Stage::Rejected.as_str(), "Certificate unavailable");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let stream = Prebuffered::new(client_hello, client);
    let tls = match tokio::time::timeout(ctx.timeouts.handshake(), acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            ctx.stats.record_rejected();
            debug!(peer = %peer, key, error = %e, stage = Stage::Rejected.as_str(), "TLS handshake failed");
            return;
        }
        Err(_) => {
            ctx.stats.record_rejected();
            debug!(peer = %peer, key, stage = Stage::Rejected.as_str(), "TLS handshake timed out");
            return;
        }
    };

    debug!(peer = %peer, key, stage = Stage::Forwarding.as_str(), "TLS terminated");
    if let Err(e) = serve_http(tls, peer, ctx, HttpRoute::Terminated { key }).await {
        debug!(peer = %peer, error = %e, "Terminated connection error");
    }
}
