//! TLS client configuration for data-node connections
//!
//! Uses rustls with the webpki root store, optionally extended with a PEM
//! CA file. Clusters running on self-signed certificates can switch
//! verification off.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::connection::TlsSettings;
use crate::error::{KvError, Result};

/// Build a connector shared by every node connection of a run
pub fn build_connector(settings: &TlsSettings) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| KvError::Config(format!("Failed to build TLS config: {}", e)))?;

    let config = if settings.verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_file) = &settings.ca_file {
            for cert in load_certs(ca_file)? {
                roots.add(cert).map_err(|e| {
                    KvError::Config(format!("Failed to add CA certificate: {}", e))
                })?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse a hostname into a TLS server name
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| KvError::InvalidArgument(format!("invalid TLS server name {}: {}", host, e)))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| KvError::Config(format!("Failed to open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| KvError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(KvError::Config(format!(
            "No certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_build_verifying_connector() {
        let settings = TlsSettings {
            ca_file: None,
            verify: true,
        };
        assert!(build_connector(&settings).is_ok());
    }

    #[test]
    fn test_build_non_verifying_connector() {
        let settings = TlsSettings {
            ca_file: None,
            verify: false,
        };
        assert!(build_connector(&settings).is_ok());
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let settings = TlsSettings {
            ca_file: Some(file.path().to_path_buf()),
            verify: true,
        };
        assert!(matches!(
            build_connector(&settings),
            Err(KvError::Config(_))
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("kv1.example.com").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }
}
