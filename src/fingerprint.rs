//! Outbound ClientHello shaping.
//!
//! An identity such as `Chrome/120` resolves to a [`FingerprintProfile`], the
//! parts of a ClientHello that rustls lets a client control: cipher-suite
//! order, key-exchange group order, offered protocol versions, ALPN and
//! session resumption. Extension order is fixed by rustls and is therefore the
//! same for every identity.
//!
//! `Golang` is the "no spoofing" identity and leaves the library defaults
//! untouched.

use crate::errors::{Error, Result};
use crate::tls::{NoVerifier, ALPN_H2, ALPN_HTTP11};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::Resumption;
use tokio_rustls::rustls::{CipherSuite, ClientConfig, NamedGroup, SupportedProtocolVersion};

/// Browser family whose ClientHello is imitated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
  /// Library default hello, no spoofing.
  Golang,
  Chrome,
  Firefox,
  Safari,
  #[allow(clippy::upper_case_acronyms)]
  IOS,
  Edge,
}

impl ClientKind {
  /// Versions with a known profile, `0` meaning the latest one.
  fn known_versions(&self) -> &'static [&'static str] {
    match self {
      ClientKind::Golang => &[],
      ClientKind::Chrome => &["0", "100", "106", "112", "120", "131"],
      ClientKind::Firefox => &["0", "102", "105", "120"],
      ClientKind::Safari => &["0", "16"],
      ClientKind::IOS => &["0", "14", "16"],
      ClientKind::Edge => &["0", "85", "106"],
    }
  }
}

impl fmt::Display for ClientKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ClientKind::Golang => "Golang",
      ClientKind::Chrome => "Chrome",
      ClientKind::Firefox => "Firefox",
      ClientKind::Safari => "Safari",
      ClientKind::IOS => "iOS",
      ClientKind::Edge => "Edge",
    };
    f.write_str(name)
  }
}

impl FromStr for ClientKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "golang" | "go" => Ok(ClientKind::Golang),
      "chrome" => Ok(ClientKind::Chrome),
      "firefox" => Ok(ClientKind::Firefox),
      "safari" => Ok(ClientKind::Safari),
      "ios" => Ok(ClientKind::IOS),
      "edge" => Ok(ClientKind::Edge),
      _ => Err(Error::Config(format!("unknown TLS client identity: {}", s))),
    }
  }
}

/// A named client implementation plus version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHelloId {
  pub client: ClientKind,
  pub version: String,
}

impl ClientHelloId {
  /// Parse and validate a `--client`/`--version` pair.
  pub fn new(client: &str, version: &str) -> Result<Self> {
    let client = ClientKind::from_str(client)?;
    let version = version.trim();
    let version = if version.is_empty() { "0" } else { version };
    if client != ClientKind::Golang && !client.known_versions().contains(&version) {
      return Err(Error::Config(format!(
        "unsupported {} version {}, known versions: {}",
        client,
        version,
        client.known_versions().join(", ")
      )));
    }
    Ok(Self {
      client,
      version: version.to_string(),
    })
  }

  /// The ClientHello shape for this identity, `None` for library defaults.
  pub fn profile(&self) -> Option<&'static FingerprintProfile> {
    match (self.client, self.version.as_str()) {
      (ClientKind::Golang, _) => None,
      (ClientKind::Chrome, _) | (ClientKind::Edge, "0" | "106") => Some(&CHROME),
      (ClientKind::Edge, _) => Some(&CHROME_LEGACY),
      (ClientKind::Firefox, _) => Some(&FIREFOX),
      (ClientKind::Safari, _) => Some(&SAFARI),
      (ClientKind::IOS, "14") => Some(&SAFARI_LEGACY),
      (ClientKind::IOS, _) => Some(&SAFARI),
    }
  }

  /// Build the shared outbound client config.
  ///
  /// The destination certificate is never verified.
  pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
    let mut provider = rustls::crypto::ring::default_provider();
    let versions: &[&SupportedProtocolVersion] = match self.profile() {
      Some(profile) => {
        provider.cipher_suites = order_by(&provider.cipher_suites, profile.cipher_suites, |s| {
          s.suite()
        });
        provider.kx_groups = order_by(&provider.kx_groups, profile.kx_groups, |g| g.name());
        if provider.cipher_suites.is_empty() || provider.kx_groups.is_empty() {
          return Err(Error::Config(format!(
            "TLS client identity {} yielded no usable parameters",
            self
          )));
        }
        profile.versions
      }
      None => rustls::DEFAULT_VERSIONS,
    };

    let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
      .with_protocol_versions(versions)?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    if let Some(profile) = self.profile() {
      config.alpn_protocols = profile.alpn.iter().map(|p| p.to_vec()).collect();
      if !profile.resumption {
        config.resumption = Resumption::disabled();
      }
    }
    Ok(Arc::new(config))
  }
}

impl fmt::Display for ClientHelloId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.client, self.version)
  }
}

/// The ClientHello fields rustls exposes, in the order they are offered.
#[derive(Debug)]
pub struct FingerprintProfile {
  pub cipher_suites: &'static [CipherSuite],
  pub kx_groups: &'static [NamedGroup],
  pub versions: &'static [&'static SupportedProtocolVersion],
  pub alpn: &'static [&'static [u8]],
  pub resumption: bool,
}

const BROWSER_ALPN: &[&[u8]] = &[ALPN_H2, ALPN_HTTP11];

static CHROME: FingerprintProfile = FingerprintProfile {
  cipher_suites: &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  ],
  kx_groups: &[NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1],
  versions: &[&rustls::version::TLS13, &rustls::version::TLS12],
  alpn: BROWSER_ALPN,
  resumption: true,
};

// Edge 85: Chromium suite order, no session resumption offered
static CHROME_LEGACY: FingerprintProfile = FingerprintProfile {
  cipher_suites: &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  ],
  kx_groups: &[NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1],
  versions: &[&rustls::version::TLS13, &rustls::version::TLS12],
  alpn: BROWSER_ALPN,
  resumption: false,
};

static FIREFOX: FingerprintProfile = FingerprintProfile {
  cipher_suites: &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
  ],
  kx_groups: &[NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1],
  versions: &[&rustls::version::TLS13, &rustls::version::TLS12],
  alpn: BROWSER_ALPN,
  resumption: true,
};

static SAFARI: FingerprintProfile = FingerprintProfile {
  cipher_suites: &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  ],
  kx_groups: &[NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1],
  versions: &[&rustls::version::TLS13, &rustls::version::TLS12],
  alpn: BROWSER_ALPN,
  resumption: true,
};

// iOS 14 still preferred P-256 ahead of X25519 for ECDHE
static SAFARI_LEGACY: FingerprintProfile = FingerprintProfile {
  cipher_suites: &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  ],
  kx_groups: &[NamedGroup::secp256r1, NamedGroup::X25519, NamedGroup::secp384r1],
  versions: &[&rustls::version::TLS13, &rustls::version::TLS12],
  alpn: BROWSER_ALPN,
  resumption: false,
};

/// Keep the entries of `available` named in `wanted`, in `wanted` order.
fn order_by<T: Copy, K: PartialEq>(available: &[T], wanted: &[K], key: impl Fn(&T) -> K) -> Vec<T> {
  wanted
    .iter()
    .filter_map(|w| available.iter().find(|a| key(a) == *w).copied())
    .collect()
}
