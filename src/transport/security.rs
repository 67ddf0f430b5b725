//! Transport security provider
//!
//! Loads certificate, key and CA material from the configured paths and
//! builds rustls client/server configurations on demand. Nothing is cached:
//! configurations are built once per listener or dial, so files are simply
//! re-read. When security is disabled both builders return `None` and
//! callers fall back to plaintext.

use crate::config::TlsSettings;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Security configuration errors
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("Invalid PEM in {}: {detail}", .path.display())]
    InvalidPem { path: PathBuf, detail: String },
    #[error("No certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("Client verifier error: {0}")]
    Verifier(String),
    #[error("Certificate generation failed: {0}")]
    Generate(String),
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds TLS configurations from [`TlsSettings`]
#[derive(Debug, Clone, Default)]
pub struct SecurityProvider {
    settings: TlsSettings,
}

impl SecurityProvider {
    pub fn new(settings: TlsSettings) -> Self {
        Self { settings }
    }

    /// A provider that always answers "plaintext"
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Client side: our certificate plus the CA used to verify servers
    pub fn client_config(&self) -> Result<Option<ClientConfig>, SecurityError> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let certs = load_certs(&self.settings.cert_path)?;
        let key = load_key(&self.settings.key_path)?;
        let roots = load_ca(&self.settings.ca_path)?;

        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;
        Ok(Some(config))
    }

    /// Server side: mutual authentication against the same CA pool
    pub fn server_config(&self) -> Result<Option<ServerConfig>, SecurityError> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let certs = load_certs(&self.settings.cert_path)?;
        let key = load_key(&self.settings.key_path)?;
        let roots = load_ca(&self.settings.ca_path)?;

        let provider = crypto_provider();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| SecurityError::Verifier(e.to_string()))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        Ok(Some(config))
    }
}

fn ensure_exists(path: &Path) -> Result<(), SecurityError> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Err(SecurityError::MissingFile(path.to_path_buf()));
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    ensure_exists(path)?;
    let invalid = |e: rustls_pki_types::pem::Error| SecurityError::InvalidPem {
        path: path.to_path_buf(),
        detail: e.to_string(),
    };

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(invalid)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;
    if certs.is_empty() {
        return Err(SecurityError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, SecurityError> {
    ensure_exists(path)?;
    PrivateKeyDer::from_pem_file(path).map_err(|e| SecurityError::InvalidPem {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn load_ca(path: &Path) -> Result<RootCertStore, SecurityError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Client configuration that accepts any server certificate
///
/// Only used by the multiplexed transport when security is disabled: QUIC
/// cannot run without TLS, so an unauthenticated handshake stands in for
/// plaintext.
pub(crate) fn insecure_client_config() -> Result<ClientConfig, SecurityError> {
    let provider = crypto_provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Server configuration with a freshly generated self-signed identity
pub(crate) fn self_signed_server_config() -> Result<ServerConfig, SecurityError> {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| SecurityError::Generate(e.to_string()))?;
    let cert = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    Ok(config)
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Write a self-signed certificate for `127.0.0.1` and use it as its own CA
#[cfg(test)]
pub(crate) fn write_test_identity(dir: &Path) -> TlsSettings {
    let generated =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
            .unwrap();
    let cert_path = dir.join("node.crt");
    let key_path = dir.join("node.key");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

    TlsSettings {
        enabled: true,
        cert_path: cert_path.clone(),
        key_path,
        ca_path: cert_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_returns_none() {
        let provider = SecurityProvider::disabled();
        assert!(!provider.is_enabled());
        assert!(provider.client_config().unwrap().is_none());
        assert!(provider.server_config().unwrap().is_none());
    }

    #[test]
    fn test_missing_files_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SecurityProvider::new(TlsSettings {
            enabled: true,
            cert_path: dir.path().join("absent.crt"),
            key_path: dir.path().join("absent.key"),
            ca_path: dir.path().join("absent.ca"),
        });

        assert!(matches!(
            provider.client_config(),
            Err(SecurityError::MissingFile(_))
        ));
        assert!(matches!(
            provider.server_config(),
            Err(SecurityError::MissingFile(_))
        ));
    }

    #[test]
    fn test_unparseable_ca_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = write_test_identity(dir.path());
        let ca_path = dir.path().join("garbage.ca");
        std::fs::write(&ca_path, "not a certificate").unwrap();
        settings.ca_path = ca_path;

        let provider = SecurityProvider::new(settings);
        assert!(matches!(
            provider.server_config(),
            Err(SecurityError::NoCertificates(_)) | Err(SecurityError::InvalidPem { .. })
        ));
    }

    #[test]
    fn test_valid_identity_builds_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SecurityProvider::new(write_test_identity(dir.path()));

        assert!(provider.client_config().unwrap().is_some());
        assert!(provider.server_config().unwrap().is_some());
    }

    #[test]
    fn test_fallback_configs_build() {
        assert!(insecure_client_config().is_ok());
        assert!(self_signed_server_config().is_ok());
    }
}
