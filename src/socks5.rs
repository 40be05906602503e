//! SOCKS5 client handshake (RFC 1928) with username/password auth (RFC 1929).
//!
//! The handshake runs on an already connected stream; once [`Socks5Proxy::connect`]
//! returns, the stream carries the tunneled bytes.
use crate::errors::{new_io_error, Error, ReplyError, Result};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Username and password for RFC 1929 authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &"***")
      .finish()
  }
}

/// A SOCKS5 upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks5Proxy {
  addr: String,
  auth: Option<Credentials>,
  remote_dns: bool,
}

impl Socks5Proxy {
  /// `addr` is the `host:port` of the SOCKS5 server. With `remote_dns` the
  /// target hostname is sent as-is, otherwise it is resolved locally first.
  pub fn new(addr: impl Into<String>, auth: Option<Credentials>, remote_dns: bool) -> Self {
    Self {
      addr: addr.into(),
      auth,
      remote_dns,
    }
  }

  /// Address of the SOCKS5 server.
  pub fn addr(&self) -> &str {
    &self.addr
  }

  /// Run the handshake and ask the server to CONNECT to `host:port`.
  ///
  /// Returns the address the server bound for the tunnel.
  pub async fn connect<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<TargetAddr>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let method = self.version_methods(stream).await?;
    let method = self.which_method_accepted(stream, method).await?;
    self.use_password_auth(stream, method).await?;
    let target = TargetAddr::resolve(host, port, self.remote_dns).await?;
    stream.write_all(&target.connect_request()?).await?;
    stream.flush().await?;
    read_request_reply(stream).await
  }

  /// VER | NMETHODS | METHODS
  async fn version_methods<S>(&self, stream: &mut S) -> Result<AuthenticationMethod>
  where
    S: AsyncWrite + Unpin,
  {
    let mut packet = vec![consts::SOCKS5_VERSION];
    let main_method = match &self.auth {
      Some(_) => {
        packet.extend([
          2,
          consts::SOCKS5_AUTH_METHOD_NONE,
          consts::SOCKS5_AUTH_METHOD_PASSWORD,
        ]);
        AuthenticationMethod::Password
      }
      None => {
        packet.extend([1, consts::SOCKS5_AUTH_METHOD_NONE]);
        AuthenticationMethod::None
      }
    };
    stream.write_all(&packet).await?;
    Ok(main_method)
  }

  /// VER | METHOD
  async fn which_method_accepted<S>(
    &self,
    stream: &mut S,
    offered: AuthenticationMethod,
  ) -> Result<AuthenticationMethod>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let [version, method] = buf;
    if version != consts::SOCKS5_VERSION {
      return Err(new_io_error(
        ErrorKind::InvalidData,
        "unsupported SOCKS version",
      ));
    }
    match method {
      consts::SOCKS5_AUTH_METHOD_NONE => Ok(AuthenticationMethod::None),
      consts::SOCKS5_AUTH_METHOD_PASSWORD if offered == AuthenticationMethod::Password => {
        Ok(AuthenticationMethod::Password)
      }
      consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => {
        Err(Error::Other("no acceptable auth methods".to_string()))
      }
      other => Err(Error::Other(format!("unexpected auth method {:#04x}", other))),
    }
  }

  /// VER(0x01) | ULEN | UNAME | PLEN | PASSWD, answered by VER | STATUS
  async fn use_password_auth<S>(&self, stream: &mut S, method: AuthenticationMethod) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let Some(Credentials { username, password }) = &self.auth else {
      return Ok(());
    };
    if method != AuthenticationMethod::Password {
      return Ok(());
    }
    let user_bytes = username.as_bytes();
    let pass_bytes = password.as_bytes();
    if user_bytes.len() > u8::MAX as usize || pass_bytes.len() > u8::MAX as usize {
      return Err(new_io_error(
        ErrorKind::InvalidInput,
        "SOCKS5 username or password too long",
      ));
    }

    let mut packet: Vec<u8> = vec![consts::SOCKS5_AUTH_VERSION, user_bytes.len() as u8];
    packet.extend(user_bytes);
    packet.push(pass_bytes.len() as u8);
    packet.extend(pass_bytes);
    stream.write_all(&packet).await?;

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let [_version, status] = buf;
    if status != consts::SOCKS5_REPLY_SUCCEEDED {
      return Err(Error::Other(format!(
        "Authentication with username `{}`, rejected.",
        username
      )));
    }
    Ok(())
  }
}

/// VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
async fn read_request_reply<S>(stream: &mut S) -> Result<TargetAddr>
where
  S: AsyncRead + Unpin,
{
  let mut buf = [0u8; 4];
  stream.read_exact(&mut buf).await?;
  let [version, reply, _rsv, address_type] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::Other(format!("version {:?}", version)));
  }
  if reply != consts::SOCKS5_REPLY_SUCCEEDED {
    return Err(Error::ReplyError(ReplyError::from(reply)));
  }
  read_address(stream, address_type).await
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
  let mut port = [0u8; 2];
  stream.read_exact(&mut port).await?;
  Ok(u16::from_be_bytes(port))
}

async fn read_address<S: AsyncRead + Unpin>(stream: &mut S, addr_type: u8) -> Result<TargetAddr> {
  let addr = match addr_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => {
      let mut buf = [0u8; 4];
      stream.read_exact(&mut buf).await?;
      TargetAddr::IP(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(buf),
        read_port(stream).await?,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_IPV6 => {
      let mut buf = [0u8; 16];
      stream.read_exact(&mut buf).await?;
      TargetAddr::IP(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(buf),
        read_port(stream).await?,
        0,
        0,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8];
      stream.read_exact(&mut len).await?;
      let mut domain = vec![0u8; len[0] as usize];
      stream.read_exact(&mut domain).await?;
      TargetAddr::Domain(
        String::from_utf8_lossy(&domain).to_string(),
        read_port(stream).await?,
      )
    }
    _ => return Err(Error::ReplyError(ReplyError::AddressTypeNotSupported)),
  };
  Ok(addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthenticationMethod {
  None,
  Password,
}

/// Destination of a SOCKS5 CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 socket address
  IP(SocketAddr),
  /// hostname, resolved by the SOCKS5 server
  Domain(String, u16),
}

impl TargetAddr {
  /// IP literals are always sent as addresses. Hostnames are sent as-is with
  /// `remote_dns`, otherwise resolved here.
  pub async fn resolve(host: &str, port: u16, remote_dns: bool) -> Result<Self> {
    if let Ok(ip) = host.parse::<IpAddr>() {
      return Ok(TargetAddr::IP(SocketAddr::new(ip, port)));
    }
    if remote_dns {
      return Ok(TargetAddr::Domain(host.to_string(), port));
    }
    let addr = tokio::net::lookup_host((host, port))
      .await?
      .next()
      .ok_or_else(|| new_io_error(ErrorKind::NotFound, "no address for host"))?;
    Ok(TargetAddr::IP(addr))
  }

  /// VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
  fn connect_request(&self) -> Result<Vec<u8>> {
    let mut packet = vec![
      consts::SOCKS5_VERSION,
      consts::SOCKS5_CMD_TCP_CONNECT,
      0x00,
    ];
    match self {
      TargetAddr::IP(SocketAddr::V4(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.extend(addr.ip().octets());
        packet.extend(addr.port().to_be_bytes());
      }
      TargetAddr::IP(SocketAddr::V6(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.extend(addr.ip().octets());
        packet.extend(addr.port().to_be_bytes());
      }
      TargetAddr::Domain(domain, port) => {
        if domain.is_empty() || domain.len() > u8::MAX as usize {
          return Err(new_io_error(
            ErrorKind::InvalidInput,
            "invalid domain name length",
          ));
        }
        packet.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        packet.push(domain.len() as u8);
        packet.extend(domain.as_bytes());
        packet.extend(port.to_be_bytes());
      }
    }
    Ok(packet)
  }
}

impl From<u8> for ReplyError {
  /// Non-zero REP field of a reply.
  fn from(value: u8) -> Self {
    match value {
      consts::SOCKS5_REPLY_GENERAL_FAILURE => ReplyError::GeneralFailure,
      consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => ReplyError::ConnectionNotAllowed,
      consts::SOCKS5_REPLY_NETWORK_UNREACHABLE => ReplyError::NetworkUnreachable,
      consts::SOCKS5_REPLY_HOST_UNREACHABLE => ReplyError::HostUnreachable,
      consts::SOCKS5_REPLY_CONNECTION_REFUSED => ReplyError::ConnectionRefused,
      consts::SOCKS5_REPLY_TTL_EXPIRED => ReplyError::TtlExpired,
      consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => ReplyError::CommandNotSupported,
      consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unknown(other),
    }
  }
}

#[rustfmt::skip]
pub mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;
  pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
  pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
  pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
  pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
  pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
  pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}
