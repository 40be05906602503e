//! Certificate Authority (CA) management
//!
//! The proxy signs every intercepted hostname with one root identity. That
//! identity is generated on first run and written next to the binary as two
//! PEM files; later runs load the same pair so clients only have to trust it
//! once.

use crate::errors::{certificate_error, Error, Result};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{
  CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::RootCertStore;

/// Common name of the generated root.
pub const CA_COMMON_NAME: &str = "proxy CA";
/// Root validity in days (10 years)
const CA_TTL_DAYS: i64 = 3650;

// PKCS#8 PrivateKeyInfo heads: version 0 and the algorithm identifier.
const PKCS8_PREFIX_ECDSA_P256: &[u8] = b"\x02\x01\x00\x30\x13\x06\x07\x2a\x86\x48\xce\x3d\x02\x01\x06\x08\x2a\x86\x48\xce\x3d\x03\x01\x07";
const PKCS8_PREFIX_ECDSA_P384: &[u8] =
  b"\x02\x01\x00\x30\x10\x06\x07\x2a\x86\x48\xce\x3d\x02\x01\x06\x05\x2b\x81\x04\x00\x22";
const PKCS8_PREFIX_RSA: &[u8] =
  b"\x02\x01\x00\x30\x0d\x06\x09\x2a\x86\x48\x86\xf7\x0d\x01\x01\x01\x05\x00";

/// Which of the two credential files exist on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
  /// Neither file exists, a new authority will be generated.
  Missing,
  /// Only the certificate exists.
  CertOnly,
  /// Only the private key exists.
  KeyOnly,
  /// Both exist and will be loaded.
  Present,
}

impl CredentialState {
  /// Inspect the filesystem for the cert/key pair.
  pub fn probe(cert_path: &Path, key_path: &Path) -> Self {
    match (cert_path.exists(), key_path.exists()) {
      (false, false) => CredentialState::Missing,
      (true, false) => CredentialState::CertOnly,
      (false, true) => CredentialState::KeyOnly,
      (true, true) => CredentialState::Present,
    }
  }
}

/// Root signing identity shared read-only by every session.
pub struct CertificateAuthority {
  /// Root CA issuer (certificate fields + private key)
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("cert_der_len", &self.cert_der.len())
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Apply the startup policy: create when both files are absent, load when
  /// both are present, refuse to start when only one of them exists.
  pub async fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self> {
    match CredentialState::probe(cert_path, key_path) {
      CredentialState::Present => Self::load(cert_path, key_path).await,
      CredentialState::Missing => {
        tracing::info!("CA cert and key do not exist, generating");
        Self::create(cert_path, key_path).await
      }
      CredentialState::CertOnly => Err(Error::Config(format!(
        "found CA cert {}, but no corresponding key",
        cert_path.display()
      ))),
      CredentialState::KeyOnly => Err(Error::Config(format!(
        "found CA key {}, but no corresponding cert",
        key_path.display()
      ))),
    }
  }

  /// Generate a new self-signed root and persist it as PEM.
  ///
  /// The key file is created with owner-only permissions.
  pub async fn create(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(1);
    params.not_after = now + Duration::days(CA_TTL_DAYS);

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| certificate_error(format!("Failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| certificate_error(format!("Failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut key_file = options.open(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;

    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key_pair);
    tracing::info!(
      "generated CA {} / {}",
      cert_path.display(),
      key_path.display()
    );
    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
    })
  }

  /// Load an existing PEM certificate/key pair.
  ///
  /// The key may be PKCS#8, SEC1 (`EC PRIVATE KEY`) or PKCS#1
  /// (`RSA PRIVATE KEY`). The pair is rejected when the key did not sign
  /// the certificate's public key.
  pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the authority from in-memory PEM text.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = parse_key_pem(key_pem)?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| certificate_error("No certificate found in PEM"))?
      .map_err(|e| certificate_error(format!("Failed to parse PEM: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| certificate_error(format!("Failed to create issuer from CA cert: {}", e)))?;

    let ca = Self {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
    };
    ca.check_key_matches()?;
    Ok(ca)
  }

  /// Signs a throwaway certificate and validates it against the root. A key
  /// that does not belong to the certificate fails the signature check.
  fn check_key_matches(&self) -> Result<()> {
    let probe_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![SanType::DnsName("localhost".try_into()?)];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(1);
    params.not_after = now + Duration::minutes(5);
    let probe = params.signed_by(&probe_key, &self.issuer)?;

    let mut roots = RootCertStore::empty();
    roots.add(self.cert_der.clone())?;
    let verifier =
      WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crate::tls::crypto_provider())
        .build()
        .map_err(|e| certificate_error(format!("Failed to build verifier: {}", e)))?;
    let server_name = ServerName::try_from("localhost")
      .map_err(|e| certificate_error(e.to_string()))?;
    verifier
      .verify_server_cert(probe.der(), &[], &server_name, &[], UnixTime::now())
      .map_err(|e| certificate_error(format!("CA key does not match CA cert: {}", e)))?;
    Ok(())
  }

  /// Issuer used to sign leaf certificates.
  pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
    &self.issuer
  }

  /// Root certificate in DER format.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Root certificate in PEM format, for installing into client trust stores.
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }
}

/// Read the first private key in `key_pem`. rcgen's ring backend only reads
/// PKCS#8, so SEC1 and PKCS#1 keys are re-wrapped into a PrivateKeyInfo.
fn parse_key_pem(key_pem: &str) -> Result<KeyPair> {
  let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
    .map_err(|e| certificate_error(format!("Failed to read CA key: {}", e)))?
    .ok_or_else(|| certificate_error("No private key found in PEM"))?;
  let candidates = match &key {
    PrivateKeyDer::Pkcs8(der) => vec![der.secret_pkcs8_der().to_vec()],
    // the curve is not known up front, ring rejects a wrong guess
    PrivateKeyDer::Sec1(der) => vec![
      wrap_pkcs8(PKCS8_PREFIX_ECDSA_P256, der.secret_sec1_der()),
      wrap_pkcs8(PKCS8_PREFIX_ECDSA_P384, der.secret_sec1_der()),
    ],
    PrivateKeyDer::Pkcs1(der) => vec![wrap_pkcs8(PKCS8_PREFIX_RSA, der.secret_pkcs1_der())],
    _ => return Err(certificate_error("Unsupported CA key encoding")),
  };
  candidates
    .into_iter()
    .find_map(|der| KeyPair::try_from(&PrivatePkcs8KeyDer::from(der)).ok())
    .ok_or_else(|| certificate_error("Failed to parse CA key: Could not parse key pair"))
}

fn wrap_pkcs8(prefix: &[u8], key: &[u8]) -> Vec<u8> {
  let octets = der_wrap(0x04, &[key]);
  der_wrap(0x30, &[prefix, octets.as_slice()])
}

/// DER tag-length-value over the concatenation of `parts`.
fn der_wrap(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
  let len: usize = parts.iter().map(|p| p.len()).sum();
  let mut out = vec![tag];
  if len < 0x80 {
    out.push(len as u8);
  } else {
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
  }
  for part in parts {
    out.extend_from_slice(part);
  }
  out
}
