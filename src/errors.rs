//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `ja3proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Certificate generation, signing or PEM parsing failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Malformed proxy request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Inconsistent or unusable startup configuration
  #[error("configuration error: {0}")]
  Config(String),
  /// Upstream SOCKS5 ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// Non-success replies of a SOCKS5 upstream.
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum ReplyError {
  /// 0x01
  #[error("General failure")]
  GeneralFailure,
  /// 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// 0x03
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// 0x04
  #[error("Host unreachable")]
  HostUnreachable,
  /// 0x05
  #[error("Connection refused")]
  ConnectionRefused,
  /// 0x06
  #[error("TTL expired")]
  TtlExpired,
  /// 0x07
  #[error("Command not supported")]
  CommandNotSupported,
  /// 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// anything else
  #[error("Unknown reply code {0:#04x}")]
  Unknown(u8),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

impl Error {
  /// Whether this error only means the peer went away.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::IO(e) => matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
          | ErrorKind::NotConnected
      ),
      _ => false,
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn certificate_error(msg: impl Into<String>) -> Error {
  let error = Error::Certificate(msg.into());
  tracing::error!("{}", error);
  error
}
