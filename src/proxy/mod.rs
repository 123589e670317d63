//! Local intercepting proxy.
//!
//! Agents reach the network through a loopback HTTP proxy. Plain HTTP
//! requests and the contents of intercepted TLS tunnels are decided by the
//! [`RequestInterceptor`](crate::interceptor::RequestInterceptor) before
//! anything is sent upstream.
//!
//! ```text
//! agent ──CONNECT──▶ listener ──peek SNI──┬─ pinned/bypass ─▶ opaque tunnel
//!                                         └─ intercept ─▶ TLS (local CA leaf)
//!                                                          │
//!                                               interceptor decision
//!                                                          │
//!                                            allow ─▶ upstream TLS (native roots)
//!                                            other ─▶ JSON 403 / 409 / 429
//! ```

pub mod ca;
mod connect;
pub mod error;
mod forward;
pub mod server;
pub mod sni;
pub mod tls;

pub use ca::{CertBundle, CertificateAuthority};
pub use error::{CaError, ProxyError, ProxyResult};
pub use forward::REQUEST_ID_HEADER;
pub use server::{ProxyConfig, ProxyServer};
pub use sni::{PINNED_DOMAINS, parse_sni_from_client_hello, should_bypass_mitm};
pub use tls::{CertificateCache, create_tls_acceptor, create_tls_connector};
