//! Interception of a single CONNECT session.
//!
//! The steps run strictly in order: dial, acknowledge, outbound handshake,
//! ALPN, leaf issuance, inbound handshake, relay. Any failure ends the session
//! and drops (closes) whatever connections it holds.

use crate::errors::{Error, Result};
use crate::host::split_host_port;
use crate::relay::{junction, Endpoint, RelayStats};
use crate::request::{connect_established, respond};
use crate::server::ProxyContext;
use crate::socket::HijackedStream;
use crate::tls::inbound_alpn;
use http::header::HOST;
use http::{Request, StatusCode};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::{client, LazyConfigAcceptor, TlsConnector};

/// CONNECT target as written by the client: the request target, or the Host
/// header when the target carries no authority.
pub fn connect_target(req: &Request<()>) -> Result<String> {
  if let Some(authority) = req.uri().authority() {
    return Ok(authority.as_str().to_string());
  }
  req
    .headers()
    .get(HOST)
    .and_then(|h| h.to_str().ok())
    .map(str::to_string)
    .ok_or_else(|| Error::InvalidRequest("CONNECT without target".to_string()))
}

/// Run one CONNECT session to completion.
pub async fn intercept(
  ctx: &ProxyContext,
  req: Request<()>,
  mut client: BufReader<TcpStream>,
  peer: SocketAddr,
) -> Result<RelayStats> {
  let target = match connect_target(&req).and_then(|t| split_host_port(&t).map(|hp| (t, hp))) {
    Ok(t) => t,
    Err(e) => {
      respond(&mut client, StatusCode::BAD_REQUEST, &e.to_string()).await?;
      return Err(e);
    }
  };
  let (authority, (host, port)) = target;
  tracing::info!("proxy to {}", authority);

  let dest = match ctx.dialer().dial(&host, port).await {
    Ok(dest) => dest,
    Err(e) => {
      tracing::warn!("tunneling to {} failed: {}", authority, e);
      respond(&mut client, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await?;
      return Err(e);
    }
  };
  let dest_name = dest
    .peer_addr()
    .map(|a| a.to_string())
    .unwrap_or_else(|_| authority.clone());

  client.write_all(&connect_established()).await?;
  client.flush().await?;
  let client = HijackedStream::hijack(client);
  if client.buffered() > 0 {
    tracing::debug!("{} bytes pipelined behind CONNECT {}", client.buffered(), authority);
  }

  let dest = outbound_handshake(ctx, &host, dest).await.map_err(|e| {
    tracing::warn!("TLS handshake with {} failed: {}", authority, e);
    e
  })?;
  let negotiated = dest.get_ref().1.alpn_protocol().map(|p| p.to_vec());
  tracing::debug!(
    "{} negotiated ALPN {:?}",
    authority,
    negotiated.as_deref().map(String::from_utf8_lossy)
  );

  let client = inbound_handshake(ctx, &host, client, negotiated.as_deref())
    .await
    .map_err(|e| {
      tracing::warn!("client TLS handshake for {} failed: {}", authority, e);
      e
    })?;

  let stats = junction(
    Endpoint::new(peer.to_string(), client),
    Endpoint::new(dest_name, dest),
    ctx.config().debug,
  )
  .await;
  tracing::debug!(
    "{} closed, {} bytes sent, {} bytes received",
    authority,
    stats.sent,
    stats.received
  );
  Ok(stats)
}

/// Spoofed ClientHello towards the destination. IP literals get no SNI.
async fn outbound_handshake(
  ctx: &ProxyContext,
  host: &str,
  dest: TcpStream,
) -> Result<client::TlsStream<TcpStream>> {
  let server_name = ServerName::try_from(host.to_string())
    .map_err(|e| Error::Other(format!("invalid server name {}: {}", host, e)))?;
  let connector = TlsConnector::from(ctx.client_config());
  Ok(connector.connect(server_name, dest).await?)
}

/// Present a leaf for the client's SNI, or for the CONNECT host when the
/// ClientHello carries none.
async fn inbound_handshake(
  ctx: &ProxyContext,
  host: &str,
  client: HijackedStream,
  negotiated: Option<&[u8]>,
) -> Result<tokio_rustls::server::TlsStream<HijackedStream>> {
  let start = LazyConfigAcceptor::new(Acceptor::default(), client).await?;
  let leaf_host = start
    .client_hello()
    .server_name()
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .unwrap_or_else(|| host.to_string());
  let leaf = ctx.leaf_issuer().issue(&leaf_host).await?;
  let config = leaf.into_server_config(inbound_alpn(negotiated))?;
  Ok(start.into_stream(config).await?)
}
