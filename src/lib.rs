//! # ja3proxy
//!
//! An HTTP forward proxy that intercepts `CONNECT` tunnels. Each tunnelled
//! TLS session is terminated with a leaf certificate minted on the fly by the
//! proxy's own CA, and re-originated towards the destination with a
//! ClientHello shaped after a chosen browser or runtime.
//!
//! - CA created on first start and reused afterwards ([`CertificateAuthority`])
//! - one shared ECDSA leaf key, a fresh certificate per hostname ([`LeafIssuer`])
//! - selectable ClientHello identity ([`ClientHelloId`])
//! - `h2` negotiated with the destination is offered back to the client
//! - optional SOCKS5 upstream, with or without username/password ([`UpstreamDialer`])
//! - plain `http://` requests are forwarded as is
//!
//! ## Running a proxy
//!
//! ```no_run
//! # async fn run() -> ja3proxy::Result<()> {
//! let config = ja3proxy::RunningConfig {
//!   tls_client: "Chrome".to_string(),
//!   ..Default::default()
//! };
//! let ctx = ja3proxy::ProxyContext::from_config(config).await?;
//! ja3proxy::ProxyServer::new(ctx).run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Clients must trust the CA certificate (`cert.pem` by default) for the
//! intercepted sessions to validate.

pub mod ca;
pub mod config;
pub mod dialer;
mod errors;
pub mod fingerprint;
pub mod host;
pub mod leaf;
pub mod mitm;
pub mod relay;
pub mod request;
pub mod server;
pub mod socket;
pub mod socks5;
pub mod tls;

pub use ca::CertificateAuthority;
pub use config::{Cli, RunningConfig};
pub use dialer::UpstreamDialer;
pub use errors::{Error, ReplyError, Result};
pub use fingerprint::{ClientHelloId, ClientKind};
pub use leaf::{IssuedLeaf, LeafIssuer, SigningKey};
pub use server::{ProxyContext, ProxyServer};
