//! Proxy listener and per-connection dispatch.

use crate::ca::CertificateAuthority;
use crate::config::RunningConfig;
use crate::dialer::UpstreamDialer;
use crate::errors::{Error, Result};
use crate::fingerprint::ClientHelloId;
use crate::leaf::{LeafIssuer, SigningKey};
use crate::mitm;
use crate::request::{forward, read_request_head, respond};
use http::{Method, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ClientConfig;

/// Everything a session needs, built once at startup and shared read-only.
#[derive(Debug)]
pub struct ProxyContext {
  config: RunningConfig,
  hello_id: ClientHelloId,
  client_config: Arc<ClientConfig>,
  dialer: UpstreamDialer,
  leaf_issuer: LeafIssuer,
}

impl ProxyContext {
  /// Startup sequence: fingerprint and upstream are validated first so a bad
  /// flag never leaves freshly generated credential files behind, then the CA
  /// is loaded or created and the shared leaf key generated.
  pub async fn from_config(config: RunningConfig) -> Result<Self> {
    let hello_id = ClientHelloId::new(&config.tls_client, &config.tls_version)?;
    let client_config = hello_id.client_config()?;
    let dialer = UpstreamDialer::new(config.upstream.as_deref())?;
    let ca = CertificateAuthority::load_or_create(&config.cert, &config.key).await?;
    let leaf_issuer = LeafIssuer::new(Arc::new(ca), SigningKey::generate()?)
      .with_cache(config.leaf_cache);
    Ok(Self {
      config,
      hello_id,
      client_config,
      dialer,
      leaf_issuer,
    })
  }

  /// Context around an already loaded authority.
  pub fn new(
    config: RunningConfig,
    ca: Arc<CertificateAuthority>,
    dialer: UpstreamDialer,
  ) -> Result<Self> {
    let hello_id = ClientHelloId::new(&config.tls_client, &config.tls_version)?;
    let client_config = hello_id.client_config()?;
    let leaf_issuer = LeafIssuer::new(ca, SigningKey::generate()?).with_cache(config.leaf_cache);
    Ok(Self {
      config,
      hello_id,
      client_config,
      dialer,
      leaf_issuer,
    })
  }

  pub fn config(&self) -> &RunningConfig {
    &self.config
  }

  pub fn hello_id(&self) -> &ClientHelloId {
    &self.hello_id
  }

  /// Outbound TLS configuration carrying the spoofed ClientHello.
  pub fn client_config(&self) -> Arc<ClientConfig> {
    self.client_config.clone()
  }

  pub fn dialer(&self) -> &UpstreamDialer {
    &self.dialer
  }

  pub fn leaf_issuer(&self) -> &LeafIssuer {
    &self.leaf_issuer
  }

  pub fn authority(&self) -> &CertificateAuthority {
    self.leaf_issuer.authority()
  }
}

/// The HTTP proxy: CONNECT requests are intercepted, everything else is
/// forwarded as plain HTTP.
#[derive(Debug, Clone)]
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
}

impl ProxyServer {
  pub fn new(ctx: ProxyContext) -> Self {
    Self { ctx: Arc::new(ctx) }
  }

  pub fn context(&self) -> &ProxyContext {
    &self.ctx
  }

  /// Bind the configured listen address.
  pub async fn bind(&self) -> Result<TcpListener> {
    let addr = self.ctx.config.listen_addr();
    TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::Other(format!("failed to bind to {}: {}", addr, e)))
  }

  /// Bind and serve until Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    let listener = self.bind().await?;
    self
      .serve(listener, async {
        let _ = tokio::signal::ctrl_c().await;
      })
      .await
  }

  /// Accept connections on `listener` until `shutdown` completes. Sessions
  /// already running are left to finish on their own.
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          tracing::info!("shutting down listener");
          return Ok(());
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
              if let Err(e) = handle_connection(&ctx, stream, peer).await {
                if e.is_disconnect() {
                  tracing::debug!("{}: {}", peer, e);
                } else {
                  tracing::error!("{}: {}", peer, e);
                }
              }
            });
          }
          Err(e) => {
            tracing::error!("failed to accept connection: {}", e);
          }
        }
      }
    }
  }
}

async fn handle_connection(ctx: &ProxyContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let req = match read_request_head(&mut reader).await {
    Ok(Some(req)) => req,
    Ok(None) => return Ok(()),
    Err(e) => {
      respond(&mut reader, StatusCode::BAD_REQUEST, &e.to_string()).await?;
      return Err(e);
    }
  };
  tracing::debug!("{} {} {}", peer, req.method(), req.uri());
  if req.method() == Method::CONNECT {
    mitm::intercept(ctx, req, reader, peer).await.map(|_| ())
  } else {
    forward(req, &mut reader, ctx.dialer()).await
  }
}
