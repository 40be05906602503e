//! Outbound TCP: directly, or through a SOCKS5 upstream.
use crate::errors::{new_io_error, Error, Result};
use crate::host::join_host_port;
use crate::socks5::{Credentials, Socks5Proxy};
use percent_encoding::percent_decode_str;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Connect timeout applied to every dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// How outbound connections are made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialStrategy {
  /// Plain TCP to the destination.
  Direct,
  /// Tunnel through a SOCKS5 server.
  Socks5(Socks5Proxy),
}

/// Immutable after construction and shared by every session.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
  strategy: DialStrategy,
  connect_timeout: Duration,
  nodelay: bool,
}

impl Default for UpstreamDialer {
  fn default() -> Self {
    Self::direct()
  }
}

impl UpstreamDialer {
  /// Direct dials with the default timeout.
  pub fn direct() -> Self {
    Self {
      strategy: DialStrategy::Direct,
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      nodelay: true,
    }
  }

  /// Build a dialer from the `--upstream` value.
  ///
  /// Accepted forms:
  /// - empty / `None`: direct
  /// - `host:port`: SOCKS5, target names resolved by the upstream
  /// - `socks5://[user:pass@]host[:port]`: SOCKS5, target names resolved locally
  /// - `socks5h://[user:pass@]host[:port]`: SOCKS5, target names resolved by the upstream
  pub fn new(upstream: Option<&str>) -> Result<Self> {
    let upstream = match upstream.map(str::trim) {
      None | Some("") => return Ok(Self::direct()),
      Some(u) => u,
    };
    let (remote_dns, rest) = match upstream.split_once("://") {
      None => (true, upstream),
      Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
        "socks5" => (false, rest),
        "socks5h" => (true, rest),
        _ => {
          return Err(Error::Config(format!(
            "unsupported upstream scheme {}, socks5 only",
            scheme
          )))
        }
      },
    };
    let rest = rest.trim_end_matches('/');
    let (auth, addr) = match rest.rsplit_once('@') {
      Some((userinfo, addr)) => (parse_userinfo(userinfo), addr),
      None => (None, rest),
    };
    let addr = normalize_upstream_addr(addr)?;
    Ok(Self {
      strategy: DialStrategy::Socks5(Socks5Proxy::new(addr, auth, remote_dns)),
      ..Self::direct()
    })
  }

  /// Override the connect timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  pub fn strategy(&self) -> &DialStrategy {
    &self.strategy
  }

  /// Open a TCP connection to `host:port`.
  ///
  /// The whole dial, including a SOCKS5 handshake, is bounded by the connect
  /// timeout.
  pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let fut = async {
      match &self.strategy {
        DialStrategy::Direct => self.connect_host(host, port).await,
        DialStrategy::Socks5(proxy) => {
          let mut stream = self.connect_authority(proxy.addr()).await?;
          proxy.connect(&mut stream, host, port).await?;
          Ok(stream)
        }
      }
    };
    tokio::time::timeout(self.connect_timeout, fut)
      .await
      .map_err(|x| new_io_error(ErrorKind::TimedOut, &x.to_string()))?
  }

  async fn connect_authority(&self, authority: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(authority).await? {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_err = Some(e),
      }
    }
    Err(last_err.unwrap_or_else(|| new_io_error(ErrorKind::NotFound, "no address for host")))
  }

  async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream> {
    self.connect_authority(&join_host_port(host, port)).await
  }

  async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    let stream = socket.connect(addr).await?;
    if self.nodelay {
      stream.set_nodelay(true)?;
    }
    Ok(stream)
  }
}

fn parse_userinfo(userinfo: &str) -> Option<Credentials> {
  let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
  let username = percent_decode_str(username).decode_utf8_lossy().to_string();
  let password = percent_decode_str(password).decode_utf8_lossy().to_string();
  if username.is_empty() {
    return None;
  }
  Some(Credentials { username, password })
}

fn normalize_upstream_addr(addr: &str) -> Result<String> {
  if addr.is_empty() {
    return Err(Error::Config("upstream has no host".to_string()));
  }
  let has_port = if addr.starts_with('[') {
    addr.contains("]:")
  } else {
    addr.contains(':')
  };
  if !has_port {
    return Ok(format!("{}:{}", addr, DEFAULT_SOCKS5_PORT));
  }
  let (_, port) = addr
    .rsplit_once(':')
    .ok_or_else(|| Error::Config(format!("invalid upstream address {}", addr)))?;
  port
    .parse::<u16>()
    .map_err(|_| Error::Config(format!("invalid upstream port {}", port)))?;
  Ok(addr.to_string())
}
