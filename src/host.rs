//! Hostname helpers shared by the interception engine and the leaf issuer.
use crate::errors::{Error, Result};
use std::net::{IpAddr, Ipv6Addr};

/// Removes the port (and IPv6 brackets) from an authority.
///
/// - `example.com:443` -> `example.com`
/// - `[2606:4700:4700::1111]:443` -> `2606:4700:4700::1111`
/// - `example.com`, `1.1.1.1`, `2606:4700:4700::1111` -> unchanged
///
/// Without brackets everything from the first colon is dropped, except for a
/// string that is already a complete IPv6 address.
pub fn strip_port(s: &str) -> String {
  if s.contains('[') && s.contains(']') {
    let s = s.replace(['[', ']'], "");
    match s.rfind(':') {
      Some(ix) => s[..ix].to_string(),
      None => s,
    }
  } else if s.parse::<Ipv6Addr>().is_ok() {
    s.to_string()
  } else {
    match s.find(':') {
      Some(ix) => s[..ix].to_string(),
      None => s.to_string(),
    }
  }
}

/// Splits a CONNECT target (`host:port` or `[v6]:port`) into host and port.
///
/// The returned host has its brackets removed. A missing port defaults to 443.
pub fn split_host_port(authority: &str) -> Result<(String, u16)> {
  if authority.is_empty() {
    return Err(Error::InvalidRequest("empty CONNECT target".to_string()));
  }
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let end = rest
      .find(']')
      .ok_or_else(|| Error::InvalidRequest(format!("unterminated IPv6 literal: {}", authority)))?;
    let host = &rest[..end];
    let port = rest[end + 1..].strip_prefix(':');
    (host, port)
  } else {
    match authority.rsplit_once(':') {
      Some((host, port)) if !host.contains(':') => (host, Some(port)),
      // more than one colon outside brackets: a bare IPv6 literal
      Some(_) => (authority, None),
      None => (authority, None),
    }
  };
  if host.is_empty() {
    return Err(Error::InvalidRequest(format!("no host in {}", authority)));
  }
  let port = match port {
    Some(p) => p
      .parse::<u16>()
      .map_err(|_| Error::InvalidRequest(format!("invalid port: {}", p)))?,
    None => 443,
  };
  Ok((host.to_string(), port))
}

/// Joins host and port back into a dialable authority, bracketing IPv6.
pub fn join_host_port(host: &str, port: u16) -> String {
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
    _ => format!("{}:{}", host, port),
  }
}

/// `true` when the hostname is an IP literal rather than a DNS name.
pub fn is_ip_literal(host: &str) -> bool {
  host.parse::<IpAddr>().is_ok()
}
