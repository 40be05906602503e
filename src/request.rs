//! HTTP/1.1 on the listening socket: request heads, canned responses and the
//! plain (non-CONNECT) forward.
use crate::dialer::UpstreamDialer;
use crate::errors::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, Request, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for the number of header fields.
pub const MAX_HEADERS: usize = 100;

/// Read one request head. `Ok(None)` means the peer closed before sending
/// anything.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<Request<()>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut total = 0usize;
  let mut line = String::new();
  // tolerate stray CRLF before the request line
  loop {
    line.clear();
    let n = read_line_limited(reader, &mut line, &mut total).await?;
    if n == 0 {
      return Ok(None);
    }
    if !line.trim().is_empty() {
      break;
    }
  }

  let mut parts = line.trim_end().splitn(3, ' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
    _ => return Err(invalid(format!("malformed request line {:?}", line.trim_end()))),
  };
  let method = Method::from_bytes(method.as_bytes()).map_err(|e| invalid(e.to_string()))?;
  let version = match version {
    "HTTP/1.1" => Version::HTTP_11,
    "HTTP/1.0" => Version::HTTP_10,
    other => return Err(invalid(format!("unsupported version {}", other))),
  };
  let uri = target
    .parse::<Uri>()
    .map_err(|e| invalid(format!("bad request target {}: {}", target, e)))?;

  let mut builder = Request::builder().method(method).uri(uri).version(version);
  let mut count = 0usize;
  loop {
    line.clear();
    let n = read_line_limited(reader, &mut line, &mut total).await?;
    if n == 0 {
      return Err(invalid("connection closed inside request head".to_string()));
    }
    let field = line.trim_end_matches(['\r', '\n']);
    if field.is_empty() {
      break;
    }
    count += 1;
    if count > MAX_HEADERS {
      return Err(invalid("too many header fields".to_string()));
    }
    let (name, value) = field
      .split_once(':')
      .ok_or_else(|| invalid(format!("malformed header line {:?}", field)))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
    builder = builder.header(name, value);
  }
  Ok(Some(builder.body(())?))
}

async fn read_line_limited<R>(reader: &mut R, line: &mut String, total: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let remaining = (MAX_HEAD_SIZE - *total) as u64;
  let n = (&mut *reader).take(remaining + 1).read_line(line).await?;
  *total += n;
  if *total > MAX_HEAD_SIZE {
    return Err(invalid("request head too large".to_string()));
  }
  Ok(n)
}

fn invalid(msg: String) -> Error {
  Error::InvalidRequest(msg)
}

/// `HTTP/1.1 200 OK` with no body, the CONNECT acknowledgement.
pub fn connect_established() -> Bytes {
  Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n")
}

/// A complete plain-text response that closes the connection.
pub fn error_response(status: StatusCode, body: &str) -> Bytes {
  let body = format!("{}\n", body);
  Bytes::from(format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    status.as_u16(),
    status.canonical_reason().unwrap_or(""),
    body.len(),
    body
  ))
}

/// Write `status` with `body` and flush.
pub async fn respond<W>(writer: &mut W, status: StatusCode, body: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&error_response(status, body)).await?;
  writer.flush().await?;
  Ok(())
}

/// Forward a plain request to its origin through `dialer` and stream the
/// response back unchanged.
///
/// The request is rewritten to origin form, `Proxy-*` and connection-scoped
/// headers are dropped and `Connection: close` is sent, so the response ends
/// at EOF and the client connection is not reused.
pub async fn forward<C>(req: Request<()>, client: &mut C, dialer: &UpstreamDialer) -> Result<()>
where
  C: AsyncBufRead + AsyncWrite + Unpin,
{
  let uri = req.uri();
  match uri.scheme_str() {
    Some("http") => {}
    _ => {
      respond(client, StatusCode::BAD_REQUEST, "absolute http:// URI required").await?;
      return Err(invalid(format!("not an absolute http URI: {}", uri)));
    }
  }
  let Some(host) = uri.host() else {
    respond(client, StatusCode::BAD_REQUEST, "missing host").await?;
    return Err(invalid(format!("no host in {}", uri)));
  };
  let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
  let port = uri.port_u16().unwrap_or(80);

  let mut dest = match dialer.dial(&host, port).await {
    Ok(dest) => dest,
    Err(e) => {
      respond(client, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await?;
      return Err(e);
    }
  };

  dest.write_all(&origin_form_head(&req)).await?;
  copy_request_body(&req, client, &mut dest).await?;
  dest.flush().await?;

  let n = tokio::io::copy(&mut dest, client).await?;
  client.flush().await?;
  tracing::debug!("{} {} -> {} response bytes", req.method(), req.uri(), n);
  Ok(())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
  let name = name.as_str();
  name.starts_with("proxy-")
    || name == CONNECTION.as_str()
    || name == "keep-alive"
    || name == "te"
    || name == "upgrade"
}

/// Serialize the head sent to the origin.
pub fn origin_form_head(req: &Request<()>) -> Vec<u8> {
  let path = req
    .uri()
    .path_and_query()
    .map(|p| p.as_str())
    .filter(|p| !p.is_empty())
    .unwrap_or("/");
  let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();
  if !req.headers().contains_key(HOST) {
    if let Some(authority) = req.uri().authority() {
      head.extend_from_slice(format!("Host: {}\r\n", authority.as_str()).as_bytes());
    }
  }
  for (name, value) in req.headers() {
    if is_hop_by_hop(name) {
      continue;
    }
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
  }
  head.extend_from_slice(b"Connection: close\r\n\r\n");
  head
}

async fn copy_request_body<C, D>(req: &Request<()>, client: &mut C, dest: &mut D) -> Result<()>
where
  C: AsyncBufRead + Unpin,
  D: AsyncWrite + Unpin,
{
  let chunked = req
    .headers()
    .get_all(TRANSFER_ENCODING)
    .iter()
    .any(|v| v.to_str().map(|s| s.to_ascii_lowercase().contains("chunked")).unwrap_or(false));
  if chunked {
    return copy_chunked(client, dest).await;
  }
  let length = match req.headers().get(CONTENT_LENGTH) {
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<u64>().ok())
      .ok_or_else(|| invalid("bad Content-Length".to_string()))?,
    None => 0,
  };
  if length > 0 {
    let copied = tokio::io::copy(&mut (&mut *client).take(length), dest).await?;
    if copied != length {
      return Err(invalid("request body ended early".to_string()));
    }
  }
  Ok(())
}

/// Pass a chunked body through verbatim, stopping after the last chunk and
/// its trailers.
async fn copy_chunked<C, D>(client: &mut C, dest: &mut D) -> Result<()>
where
  C: AsyncBufRead + Unpin,
  D: AsyncWrite + Unpin,
{
  let mut line = String::new();
  loop {
    line.clear();
    if client.read_line(&mut line).await? == 0 {
      return Err(invalid("chunked body ended early".to_string()));
    }
    dest.write_all(line.as_bytes()).await?;
    let size_field = line.trim_end().split(';').next().unwrap_or("").trim();
    let size = u64::from_str_radix(size_field, 16)
      .map_err(|_| invalid(format!("bad chunk size {:?}", size_field)))?;
    if size == 0 {
      // trailers up to the empty line
      loop {
        line.clear();
        if client.read_line(&mut line).await? == 0 {
          return Err(invalid("chunked body ended early".to_string()));
        }
        dest.write_all(line.as_bytes()).await?;
        if line.trim_end().is_empty() {
          return Ok(());
        }
      }
    }
    // data plus its trailing CRLF
    let want = size + 2;
    let copied = tokio::io::copy(&mut (&mut *client).take(want), dest).await?;
    if copied != want {
      return Err(invalid("chunked body ended early".to_string()));
    }
  }
}
