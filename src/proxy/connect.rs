//! HTTP CONNECT handling.
//!
//! After `200 Connection Established` the first bytes from the client are
//! read to find the TLS server name. Pinned and configured bypass hosts are
//! tunneled opaquely; everything else is intercepted: the client handshake
//! is terminated with a leaf certificate from our CA and each request inside
//! the tunnel goes through the interceptor before being sent upstream over
//! a verified TLS connection.

use super::error::ProxyError;
use super::forward::{self, ProxyBody, decision_response, empty_body};
use super::server::ProxyContext;
use super::sni::{parse_sni_from_client_hello, should_bypass_mitm};
use super::tls::{create_tls_acceptor, domain_to_server_name};
use crate::interceptor::{InterceptDecision, InterceptRequest, Protocol};
use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound on bytes read while looking for the ClientHello.
const MAX_HELLO_BYTES: usize = 16 * 1024;
/// How long to wait for the client to speak first.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_RECORD_HEADER: usize = 5;
const TLS_HANDSHAKE: u8 = 0x16;

type ClientIo = TokioIo<Upgraded>;

/// Handle a CONNECT request from the proxy listener.
pub(crate) async fn handle_connect(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    source_port: u16,
) -> Result<Response<ProxyBody>, ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing authority in CONNECT request".into()))?
        .to_string();
    let (host, port) = parse_host_port(&authority)?;
    debug!(host = %host, port, "CONNECT");

    // Hosts known up front to bypass interception are decided before the
    // tunnel opens, so a refusal reaches the client as a proper response.
    if !ctx.intercept_tls || should_bypass_mitm(&host, &ctx.bypass_domains) {
        let decision = decide_tunnel(&ctx, &req, &host, port, source_port).await;
        if !decision.is_allowed() {
            return Ok(decision_response(&decision));
        }
        let request_id = decision.request_id;
        return Ok(upgrade_then(req, authority, move |client| {
            opaque_tunnel(ctx, client, Bytes::new(), host, port, request_id)
        }));
    }

    Ok(upgrade_then(req, authority, move |mut client| async move {
        let hello = read_client_hello(&mut client).await?;
        let server_name = parse_sni_from_client_hello(&hello)
            .map(|sni| sni.to_ascii_lowercase())
            .unwrap_or_else(|| host.clone());

        if should_bypass_mitm(&server_name, &ctx.bypass_domains) {
            let probe = InterceptRequest::new("CONNECT", https_url(&server_name, port, "/"))
                .source_port(source_port);
            let decision = ctx.interceptor.intercept(&probe).await;
            if !decision.is_allowed() {
                info!(host = %server_name, reason = %decision.reason, "Refusing bypassed tunnel");
                return Ok(());
            }
            return opaque_tunnel(ctx, client, hello, host, port, decision.request_id).await;
        }

        intercept_session(ctx, PrefixedStream::new(hello, client), server_name, host, port, source_port)
            .await
    }))
}

/// Domain-level decision for a tunnel whose contents will not be seen.
async fn decide_tunnel(
    ctx: &ProxyContext,
    req: &Request<Incoming>,
    host: &str,
    port: u16,
    source_port: u16,
) -> InterceptDecision {
    let mut probe = InterceptRequest::new("CONNECT", https_url(host, port, "/")).source_port(source_port);
    probe.headers = forward::header_pairs(req.headers());
    ctx.interceptor.intercept(&probe).await
}

/// Answer `200` and run `f` on the upgraded connection.
fn upgrade_then<F, Fut>(req: Request<Incoming>, authority: String, f: F) -> Response<ProxyBody>
where
    F: FnOnce(ClientIo) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ProxyError>> + Send,
{
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = f(TokioIo::new(upgraded)).await {
                    debug!(authority = %authority, error = %e, "Tunnel ended");
                }
            }
            Err(e) => warn!(authority = %authority, error = %e, "HTTP upgrade failed"),
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

/// Read until a complete TLS record is buffered, the client stops sending,
/// or the peek budget is spent. Whatever was read is replayed later.
async fn read_client_hello(client: &mut ClientIo) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(needed) = record_len(&buf)
            && buf.len() >= needed
        {
            break;
        }
        if buf.len() >= MAX_HELLO_BYTES {
            break;
        }
        match tokio::time::timeout(HELLO_TIMEOUT, client.read_buf(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(buf.freeze())
}

/// Full length of the first TLS record, or 0 if the data is not TLS.
fn record_len(buf: &[u8]) -> Option<usize> {
    match buf.first() {
        None => None,
        Some(&b) if b != TLS_HANDSHAKE => Some(0),
        Some(_) if buf.len() < TLS_RECORD_HEADER => None,
        Some(_) => Some(TLS_RECORD_HEADER + usize::from(u16::from_be_bytes([buf[3], buf[4]]))),
    }
}

/// Relay bytes without decryption.
async fn opaque_tunnel(
    ctx: Arc<ProxyContext>,
    mut client: ClientIo,
    prefix: Bytes,
    host: String,
    port: u16,
    request_id: String,
) -> Result<(), ProxyError> {
    let mut upstream = match connect_upstream(&ctx, &host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            ctx.interceptor.finalize(&request_id, 502, 0);
            return Err(e);
        }
    };
    if !prefix.is_empty() {
        upstream.write_all(&prefix).await?;
    }

    let result = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    let received = result.as_ref().map_or(0, |(_, down)| *down);
    ctx.interceptor.finalize(&request_id, 200, received);
    debug!(host = %host, port, bytes = received, "Opaque tunnel closed");
    result.map(|_| ()).map_err(ProxyError::from)
}

/// Terminate the client's TLS and serve HTTP/1.1 inside the tunnel.
async fn intercept_session(
    ctx: Arc<ProxyContext>,
    client: PrefixedStream<ClientIo>,
    server_name: String,
    host: String,
    port: u16,
    source_port: u16,
) -> Result<(), ProxyError> {
    let acceptor = create_tls_acceptor(ctx.certs.clone(), Some(server_name.clone()));
    let tls = acceptor
        .accept(client)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {e}")))?;
    debug!(host = %server_name, "Client TLS established");

    let upstream = Arc::new(UpstreamSession::new(ctx.clone(), host, port, server_name.clone()));
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let upstream = upstream.clone();
        let url = https_url(&server_name, port, &path_and_query(req.uri()));
        async move {
            forward::serve_request(&ctx, req, url, Protocol::Https, Some(source_port), |r| {
                upstream.send(r)
            })
            .await
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .await?;
    Ok(())
}

/// One upstream TLS connection per intercepted tunnel, reopened when the
/// server closes it.
struct UpstreamSession {
    ctx: Arc<ProxyContext>,
    host: String,
    port: u16,
    server_name: String,
    sender: tokio::sync::Mutex<Option<SendRequest<Full<Bytes>>>>,
}

impl UpstreamSession {
    fn new(ctx: Arc<ProxyContext>, host: String, port: u16, server_name: String) -> Self {
        Self {
            ctx,
            host,
            port,
            server_name,
            sender: tokio::sync::Mutex::new(None),
        }
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError> {
        let mut slot = self.sender.lock().await;
        let mut sender = match slot.take() {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        if sender.ready().await.is_err() {
            sender = self.connect().await?;
        }
        let result = sender.send_request(req).await;
        *slot = Some(sender);
        Ok(result?)
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, ProxyError> {
        let connector = self
            .ctx
            .tls_connector
            .as_ref()
            .ok_or_else(|| ProxyError::Tls("No trusted roots for upstream TLS".into()))?;
        let tcp = connect_upstream(&self.ctx, &self.host, self.port).await?;
        let tls = connector
            .connect(domain_to_server_name(&self.server_name)?, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {e}")))?;

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        let host = self.server_name.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(host = %host, error = %e, "Upstream connection closed");
            }
        });
        Ok(sender)
    }
}

async fn connect_upstream(ctx: &ProxyContext, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    let addr = format_authority(host, port);
    let stream = tokio::time::timeout(ctx.upstream_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Parse `host[:port]` from a CONNECT authority, defaulting to 443.
pub(crate) fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    let invalid = |what: &str| ProxyError::InvalidRequest(format!("Invalid CONNECT target '{authority}': {what}"));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid("bad port"))?,
            None if tail.is_empty() => 443,
            None => return Err(invalid("bad port")),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| invalid("bad port"))?;
            if host.is_empty() {
                return Err(invalid("empty host"));
            }
            Ok((host.to_ascii_lowercase(), port))
        }
        None if authority.is_empty() => Err(invalid("empty host")),
        None => Ok((authority.to_ascii_lowercase(), 443)),
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn https_url(host: &str, port: u16, path: &str) -> String {
    if port == 443 {
        let host = if host.contains(':') { format!("[{host}]") } else { host.to_string() };
        format!("https://{host}{path}")
    } else {
        format!("https://{}{path}", format_authority(host, port))
    }
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string())
}

/// A stream that first replays bytes already read from it.
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
