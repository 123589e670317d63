//! Loopback proxy listener.
//!
//! Accepts HTTP/1.1 proxy connections on a loopback address. `CONNECT`
//! requests are handed to [`super::connect`]; absolute-form plain HTTP
//! requests are decided and forwarded directly. Each connection runs in its
//! own task until the shutdown signal flips.

use super::connect::handle_connect;
use super::error::{ProxyError, ProxyResult};
use super::forward::{self, ProxyBody, json_response};
use super::tls::{CertificateCache, create_tls_connector};
use crate::interceptor::{Protocol, RequestInterceptor};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8888";
/// Default upstream connect timeout.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Must be a loopback address.
    pub listen: SocketAddr,
    /// Decrypt CONNECT tunnels. When off every tunnel is opaque.
    pub intercept_tls: bool,
    /// Extra hosts (globs) tunneled without decryption.
    pub bypass_domains: Vec<String>,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8888)),
            intercept_tls: true,
            bypass_domains: Vec::new(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

/// State shared by every connection.
pub(crate) struct ProxyContext {
    pub(crate) interceptor: Arc<RequestInterceptor>,
    pub(crate) certs: Arc<CertificateCache>,
    pub(crate) intercept_tls: bool,
    pub(crate) bypass_domains: Vec<String>,
    pub(crate) upstream_timeout: Duration,
    /// `None` when no trusted roots could be loaded; intercepted requests
    /// then fail with 502.
    pub(crate) tls_connector: Option<TlsConnector>,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

/// The proxy listener.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Non-loopback addresses are refused.
    pub async fn bind(
        config: ProxyConfig,
        interceptor: Arc<RequestInterceptor>,
        certs: Arc<CertificateCache>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        if !config.listen.ip().is_loopback() {
            return Err(ProxyError::NonLoopback(config.listen));
        }
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen,
                source,
            })?;

        let tls_connector = match create_tls_connector() {
            Ok(connector) => Some(connector),
            Err(e) => {
                warn!(error = %e, "Upstream TLS unavailable; intercepted requests will fail");
                None
            }
        };

        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(config.upstream_timeout));
        http.set_nodelay(true);
        let http_client = Client::builder(TokioExecutor::new()).build(http);

        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                interceptor,
                certs,
                intercept_tls: config.intercept_tls,
                bypass_domains: config.bypass_domains,
                upstream_timeout: config.upstream_timeout,
                tls_connector,
                http_client,
            }),
            shutdown_rx,
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(self) -> ProxyResult<()> {
        info!(addr = %self.local_addr()?, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            self.spawn_connection_handler(stream, peer);
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_connection_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, ctx).await {
                let message = e.to_string();
                if message.contains("connection reset") || message.contains("broken pipe") {
                    debug!(peer = %peer, error = %e, "Connection ended");
                } else {
                    warn!(peer = %peer, error = %e, "Connection error");
                }
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<()> {
    stream.set_nodelay(true)?;
    let io = TokioIo::new(stream);
    let source_port = peer.port();

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { proxy_request(ctx, req, source_port).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

async fn proxy_request(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    source_port: u16,
) -> ProxyResult<Response<ProxyBody>> {
    let result = if req.method() == Method::CONNECT {
        handle_connect(ctx, req, source_port).await
    } else {
        handle_http(ctx, req, source_port).await
    };
    match result {
        Err(ProxyError::InvalidRequest(message)) => Ok(json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_request", "reason": message}).to_string(),
            None,
        )),
        other => other,
    }
}

/// Plain HTTP: the request line must carry an absolute URI.
async fn handle_http(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    source_port: u16,
) -> ProxyResult<Response<ProxyBody>> {
    let uri = req.uri();
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyError::InvalidRequest(format!(
            "Proxy requests need an absolute URI, got '{uri}'"
        )));
    }
    let url = uri.to_string();
    let authority = uri.authority().map(|a| a.to_string()).unwrap_or_default();

    let client = ctx.http_client.clone();
    forward::serve_request(&ctx, req, url, Protocol::Http, Some(source_port), |upstream| async move {
        client
            .request(upstream)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: authority,
                message: e.to_string(),
            })
    })
    .await
}
