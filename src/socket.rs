//! Raw client connection taken over after a CONNECT.
use bytes::{Buf, Bytes};
use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;

/// The client socket, with whatever the request parser had already buffered
/// past the request head replayed before the socket is read again.
///
/// A client may pipeline its TLS ClientHello right behind the CONNECT head;
/// those bytes must reach the TLS acceptor.
#[derive(Debug)]
pub struct HijackedStream {
  prefix: Bytes,
  inner: TcpStream,
}

impl HijackedStream {
  /// Take exclusive raw control of the connection behind `reader`.
  pub fn hijack(reader: BufReader<TcpStream>) -> Self {
    let prefix = Bytes::copy_from_slice(reader.buffer());
    Self {
      prefix,
      inner: reader.into_inner(),
    }
  }

  /// Bytes received but not yet consumed.
  pub fn buffered(&self) -> usize {
    self.prefix.len()
  }
}

impl AsyncRead for HijackedStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      buf.put_slice(&self.prefix[..n]);
      self.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for HijackedStream {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
