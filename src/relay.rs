//! Bidirectional byte relay between two established streams.
//!
//! Each direction runs as its own task. When one direction stops (EOF, read
//! or write error) it shuts its writer down and raises a shared close signal,
//! which ends the other direction's pending copy. [`junction`] returns once
//! both tasks have finished, after which both streams are dropped and closed.

use std::fmt::Write as _;
use std::io::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Byte counts moved by a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
  /// client -> destination
  pub sent: u64,
  /// destination -> client
  pub received: u64,
}

/// A stream plus the name its traffic is logged under in debug mode.
pub struct Endpoint<S> {
  pub name: String,
  pub stream: S,
}

impl<S> Endpoint<S> {
  pub fn new(name: impl Into<String>, stream: S) -> Self {
    Self {
      name: name.into(),
      stream,
    }
  }
}

/// Copy `client` <-> `dest` until both directions are done.
///
/// With `debug` set, every write is logged with its size and payload.
pub async fn junction<A, B>(client: Endpoint<A>, dest: Endpoint<B>, debug: bool) -> RelayStats
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (client_read, client_write) = tokio::io::split(client.stream);
  let (dest_read, dest_write) = tokio::io::split(dest.stream);
  let (close_tx, close_rx) = watch::channel(false);
  let close_tx = Arc::new(close_tx);

  let upstream = tokio::spawn(pipe(
    client_read,
    DebugWriter::new(dest_write, client.name, debug),
    close_tx.clone(),
    close_rx.clone(),
  ));
  let downstream = tokio::spawn(pipe(
    dest_read,
    DebugWriter::new(client_write, dest.name, debug),
    close_tx,
    close_rx,
  ));

  let (sent, received) = tokio::join!(upstream, downstream);
  RelayStats {
    sent: sent.unwrap_or_else(|e| {
      tracing::debug!("relay task failed: {}", e);
      0
    }),
    received: received.unwrap_or_else(|e| {
      tracing::debug!("relay task failed: {}", e);
      0
    }),
  }
}

async fn pipe<R, W>(
  mut reader: R,
  mut writer: DebugWriter<W>,
  close: Arc<watch::Sender<bool>>,
  mut closed: watch::Receiver<bool>,
) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let copied = tokio::select! {
    r = tokio::io::copy(&mut reader, &mut writer) => r,
    _ = closed.wait_for(|c| *c) => Ok(0),
  };
  match copied {
    Ok(_) => tracing::debug!("{} done after {} bytes", writer.name, writer.written),
    Err(e) => tracing::debug!("{} copy error: {}", writer.name, e),
  }
  let _ = close.send(true);
  if let Err(e) = writer.shutdown().await {
    tracing::debug!("{} shutdown: {}", writer.name, e);
  }
  writer.written
}

/// Writer that optionally logs everything passing through it.
///
/// Only the bytes the inner writer accepted are logged, so the dump matches
/// what was transmitted.
pub struct DebugWriter<W> {
  inner: W,
  name: String,
  enabled: bool,
  written: u64,
}

impl<W> DebugWriter<W> {
  pub fn new(inner: W, name: impl Into<String>, enabled: bool) -> Self {
    Self {
      inner,
      name: name.into(),
      enabled,
      written: 0,
    }
  }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DebugWriter<W> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
    if let Poll::Ready(Ok(n)) = poll {
      self.written += n as u64;
      if self.enabled && n > 0 {
        tracing::debug!(
          "{} send {} bytes: \n{}",
          self.name,
          n,
          render_payload(&buf[..n])
        );
      }
    }
    poll
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Text when the payload starts printable, a hex dump otherwise.
pub fn render_payload(data: &[u8]) -> String {
  match data.first() {
    Some(b) if is_printable(*b) => String::from_utf8_lossy(data).into_owned(),
    _ => hexdump(data),
  }
}

/// The byte read as a Latin-1 code point is printable: ASCII graphic, space,
/// or the Latin-1 supplement minus NBSP and the soft hyphen.
fn is_printable(b: u8) -> bool {
  b.is_ascii_graphic() || b == b' ' || (b >= 0xa1 && b != 0xad)
}

/// `hexdump -C` style listing: offset, 16 hex bytes, ASCII column.
pub fn hexdump(data: &[u8]) -> String {
  let mut out = String::new();
  for (i, chunk) in data.chunks(16).enumerate() {
    let encoded = hex::encode(chunk);
    let mut hex_col = String::with_capacity(49);
    for (j, pair) in encoded.as_bytes().chunks(2).enumerate() {
      if j == 8 {
        hex_col.push(' ');
      }
      hex_col.push_str(std::str::from_utf8(pair).unwrap_or("??"));
      hex_col.push(' ');
    }
    let ascii: String = chunk
      .iter()
      .map(|b| {
        if b.is_ascii_graphic() || *b == b' ' {
          *b as char
        } else {
          '.'
        }
      })
      .collect();
    let _ = writeln!(out, "{:08x}  {:<49} |{}|", i * 16, hex_col, ascii);
  }
  out
}
