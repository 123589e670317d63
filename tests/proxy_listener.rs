use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use rashomon::cli::Cli;
use rashomon::config::ConfigLoader;
use rashomon::interceptor::RequestInterceptor;
use rashomon::orchestrator::open_services;
use rashomon::proxy::{CertificateAuthority, CertificateCache, ProxyConfig, ProxyServer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

const POLICY: &str = r#"
name: listener
global:
  default_action: block
  max_request_body_bytes: 1024
domains:
  allowed: ["127.0.0.1"]
  denied: ["*.pastebin.test"]
secrets:
  entropy_detection:
    enabled: false
"#;

struct Harness {
    addr: SocketAddr,
    ca: Arc<CertificateAuthority>,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start(extra_args: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut args = vec!["rashomon", "--data-dir", dir.path().to_str().unwrap()];
    args.extend_from_slice(extra_args);
    let cli = Cli::try_parse_from(args).unwrap();
    let settings = ConfigLoader::with_paths(dir.path().join("system.toml"), dir.path().join("user.toml"))
        .load(&cli)
        .unwrap();
    std::fs::create_dir_all(&settings.policy_dir).unwrap();
    std::fs::write(settings.policy_dir.join("listener.yaml"), POLICY).unwrap();

    let (services, _) = open_services(&settings).unwrap();
    let interceptor = Arc::new(RequestInterceptor::new(services));
    let ca = Arc::new(CertificateAuthority::load_or_create(dir.path()).unwrap());
    let certs = Arc::new(CertificateCache::new(ca.clone()));

    let (tx, rx) = watch::channel(false);
    let config = ProxyConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..settings.proxy_config()
    };
    let server = ProxyServer::bind(config, interceptor, certs, rx).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Harness {
        addr,
        ca,
        _shutdown: tx,
        _dir: dir,
    }
}

/// Single-shot upstream that reports the request head it received.
async fn upstream() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let _ = tx.send(head);
    });
    (addr, rx)
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    // A peer that closes without close_notify still leaves what it sent.
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).to_ascii_lowercase()
}

#[tokio::test]
async fn test_denied_domain_gets_json_refusal() {
    let proxy = start(&[]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let response = exchange(
        &mut client,
        "GET http://dump.pastebin.test/raw HTTP/1.1\r\n\
         Host: dump.pastebin.test\r\n\
         X-Rashomon-Agent-Id: listener-agent\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("http/1.1 403"), "{response}");
    assert!(response.contains("content-type: application/json"));
    assert!(response.contains("x-rashomon-request-id:"));
    assert!(response.contains("*.pastebin.test"));
}

#[tokio::test]
async fn test_allowed_request_reaches_upstream_without_internal_headers() {
    let proxy = start(&[]).await;
    let (upstream_addr, head) = upstream().await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let response = exchange(
        &mut client,
        &format!(
            "GET http://{upstream_addr}/status HTTP/1.1\r\n\
             Host: {upstream_addr}\r\n\
             X-Rashomon-Agent-Id: listener-agent\r\n\
             X-Rashomon-Agent-Purpose: integration\r\n\
             Accept: text/plain\r\n\
             Connection: close\r\n\r\n"
        ),
    )
    .await;

    assert!(response.starts_with("http/1.1 200"), "{response}");
    assert!(response.contains("x-rashomon-request-id:"));
    assert!(response.contains("\r\n\r\nhello"));

    let head = head.await.unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /status http/1.1"), "{head}");
    assert!(head.contains("accept: text/plain"));
    assert!(!head.contains("x-rashomon-"));
}

#[tokio::test]
async fn test_secret_in_body_never_leaves_the_proxy() {
    let proxy = start(&[]).await;
    let (upstream_addr, mut head) = upstream().await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let body = "AWS_ACCESS_KEY_ID=AKIA1234567890ABCDEF";
    let response = exchange(
        &mut client,
        &format!(
            "POST http://{upstream_addr}/upload HTTP/1.1\r\n\
             Host: {upstream_addr}\r\n\
             X-Rashomon-Agent-Id: listener-agent\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await;

    assert!(response.starts_with("http/1.1 403"), "{response}");
    assert!(!response.contains("akia1234567890abcdef"));
    assert!(head.try_recv().is_err());
}

#[tokio::test]
async fn test_oversized_body_is_refused_without_forwarding() {
    let proxy = start(&[]).await;
    let (upstream_addr, mut head) = upstream().await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let body = "a".repeat(1500);
    let response = exchange(
        &mut client,
        &format!(
            "POST http://{upstream_addr}/upload HTTP/1.1\r\n\
             Host: {upstream_addr}\r\n\
             X-Rashomon-Agent-Id: listener-agent\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await;

    assert!(response.starts_with("http/1.1 403"), "{response}");
    assert!(response.contains("body:max_bytes"));
    assert!(head.try_recv().is_err());
}

#[tokio::test]
async fn test_opaque_tunnel_to_denied_domain_is_refused() {
    let proxy = start(&["--no-tls-intercept"]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let response = exchange(
        &mut client,
        "CONNECT dump.pastebin.test:443 HTTP/1.1\r\n\
         Host: dump.pastebin.test:443\r\n\
         X-Rashomon-Agent-Id: listener-agent\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("http/1.1 403"), "{response}");
    assert!(response.contains("content-type: application/json"));
}

#[tokio::test]
async fn test_intercepted_tunnel_is_decided_per_request() {
    let proxy = start(&[]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client
        .write_all(
            b"CONNECT dump.pastebin.test:443 HTTP/1.1\r\n\
              Host: dump.pastebin.test:443\r\n\r\n",
        )
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut roots = rustls::RootCertStore::empty();
    let mut pem = proxy.ca.cert_pem().as_bytes();
    for cert in rustls_pemfile::certs(&mut pem) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls_pki_types::ServerName::try_from("dump.pastebin.test").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();

    let response = exchange(
        &mut tls,
        "GET /raw HTTP/1.1\r\n\
         Host: dump.pastebin.test\r\n\
         X-Rashomon-Agent-Id: listener-agent\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("http/1.1 403"), "{response}");
    assert!(response.contains("x-rashomon-request-id:"));
}
