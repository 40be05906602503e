//! TLS configuration shared by both legs of an intercepted session.
use crate::errors::Result;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, ServerConfig,
  SignatureScheme,
};

/// ALPN identifier of HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier of HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The ring provider every config in the crate is built from.
pub fn crypto_provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// ALPN list to advertise to the client, given what the destination picked.
///
/// Only an `h2` destination changes the inbound offer, and then the client may
/// still fall back to HTTP/1.1.
pub fn inbound_alpn(outbound: Option<&[u8]>) -> Vec<Vec<u8>> {
  match outbound {
    Some(proto) if proto == ALPN_H2 => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
    _ => Vec::new(),
  }
}

/// Server side config presenting `chain` with `key`; client certificates are
/// never requested.
pub fn server_config(
  chain: Vec<rustls_pki_types::CertificateDer<'static>>,
  key: rustls_pki_types::PrivateKeyDer<'static>,
  alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
  config.alpn_protocols = alpn_protocols;
  Ok(Arc::new(config))
}

/// Accepts any destination certificate.
///
/// The proxy re-signs every destination with its own CA, so the client is the
/// party that decides whom to trust.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
    ]
  }
}
