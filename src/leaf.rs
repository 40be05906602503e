//! Per-hostname leaf certificates.
//!
//! Every leaf carries the public half of one process-wide [`SigningKey`]; only
//! the subject, SAN and serial differ between hostnames. Issuance follows the
//! usual request/sign split: a CSR is built and self-signed with the signing
//! key, then the CA applies its signing policy and signs the result.

use crate::ca::CertificateAuthority;
use crate::errors::{certificate_error, Error, Result};
use crate::host::strip_port;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
  ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf validity (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Back-dating of `notBefore` to absorb client clock skew.
const NOT_BEFORE_OFFSET: i64 = 60;

/// The single key pair embedded in every issued leaf. Lives only in memory.
pub struct SigningKey {
  key_pair: KeyPair,
  key_der: PrivatePkcs8KeyDer<'static>,
}

impl std::fmt::Debug for SigningKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SigningKey").finish_non_exhaustive()
  }
}

impl SigningKey {
  /// Generate a fresh ECDSA P-256 key.
  pub fn generate() -> Result<Self> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| certificate_error(format!("Failed to generate signing key: {}", e)))?;
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok(Self { key_pair, key_der })
  }

  /// DER encoded private key, ready for a rustls server config.
  pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(self.key_der.clone_key())
  }
}

/// A servable identity for exactly one hostname.
#[derive(Debug)]
pub struct IssuedLeaf {
  hostname: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl IssuedLeaf {
  /// Hostname the leaf is valid for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// `[leaf, CA]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// The leaf certificate alone.
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }

  /// Consume the leaf into a server config advertising `alpn_protocols`.
  pub fn into_server_config(self, alpn_protocols: Vec<Vec<u8>>) -> Result<Arc<ServerConfig>> {
    crate::tls::server_config(self.chain, self.key, alpn_protocols)
  }
}

/// Signs leaves with the CA, optionally remembering recent ones.
pub struct LeafIssuer {
  ca: Arc<CertificateAuthority>,
  signing_key: SigningKey,
  cache: Option<Cache<String, Arc<Vec<CertificateDer<'static>>>>>,
}

impl std::fmt::Debug for LeafIssuer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafIssuer")
      .field("ca", &self.ca)
      .field("cached", &self.cache.as_ref().map(|c| c.entry_count()))
      .finish()
  }
}

impl LeafIssuer {
  /// Issuer that signs fresh for every request.
  pub fn new(ca: Arc<CertificateAuthority>, signing_key: SigningKey) -> Self {
    Self {
      ca,
      signing_key,
      cache: None,
    }
  }

  /// Keep up to `capacity` chains keyed by hostname, each for half the leaf
  /// lifetime. A capacity of 0 disables caching.
  pub fn with_cache(mut self, capacity: u64) -> Self {
    self.cache = if capacity == 0 {
      None
    } else {
      Some(
        Cache::builder()
          .max_capacity(capacity)
          .time_to_live(StdDuration::from_secs((LEAF_TTL_SECS / 2) as u64))
          .build(),
      )
    };
    self
  }

  /// The authority leaves are signed by.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Issue a leaf for `hostname`. Ports and IPv6 brackets are stripped first.
  pub async fn issue(&self, hostname: &str) -> Result<IssuedLeaf> {
    let hostname = strip_port(hostname);
    if hostname.is_empty() {
      return Err(Error::Certificate("empty hostname".to_string()));
    }
    let chain = match &self.cache {
      Some(cache) => {
        if let Some(chain) = cache.get(&hostname).await {
          tracing::debug!("leaf cache hit for {}", hostname);
          chain.as_ref().clone()
        } else {
          let chain = self.sign(&hostname)?;
          cache
            .insert(hostname.clone(), Arc::new(chain.clone()))
            .await;
          chain
        }
      }
      None => self.sign(&hostname)?,
    };
    Ok(IssuedLeaf {
      hostname,
      chain,
      key: self.signing_key.private_key_der(),
    })
  }

  fn sign(&self, hostname: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut request = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    request.distinguished_name = dn;
    request.subject_alt_names = vec![san_for(hostname)?];
    let csr = request
      .serialize_request(&self.signing_key.key_pair)
      .map_err(|e| certificate_error(format!("Failed to build CSR for {}: {}", hostname, e)))?;

    let mut csr = CertificateSigningRequestParams::from_der(csr.der())
      .map_err(|e| certificate_error(format!("Failed to parse CSR for {}: {}", hostname, e)))?;
    apply_signing_policy(&mut csr.params);

    let cert = csr
      .signed_by(self.ca.issuer())
      .map_err(|e| certificate_error(format!("Failed to sign leaf for {}: {}", hostname, e)))?;
    tracing::debug!("signed leaf for {}", hostname);
    Ok(vec![cert.der().clone(), self.ca.cert_der().clone()])
  }
}

fn san_for(hostname: &str) -> Result<SanType> {
  match hostname.parse::<IpAddr>() {
    Ok(ip) => Ok(SanType::IpAddress(ip)),
    Err(_) => {
      let name = hostname
        .try_into()
        .map_err(|_| certificate_error(format!("Invalid domain name: {}", hostname)))?;
      Ok(SanType::DnsName(name))
    }
  }
}

/// Server leaf policy: signature + key encipherment, server and client auth,
/// random serial, one year from a minute ago.
fn apply_signing_policy(params: &mut CertificateParams) {
  params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  params.extended_key_usages = vec![
    ExtendedKeyUsagePurpose::ServerAuth,
    ExtendedKeyUsagePurpose::ClientAuth,
  ];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::seconds(LEAF_TTL_SECS);
}
