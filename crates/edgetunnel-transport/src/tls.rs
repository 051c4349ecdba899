//! Client TLS configuration shared by the QUIC and HTTP/2 transports

use crate::{TransportError, TransportResult, TransportSecurityConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default (once)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Build a rustls client config with the given roots and ALPN identifiers
pub fn build_client_crypto(
    security: &TransportSecurityConfig,
) -> TransportResult<rustls::ClientConfig> {
    ensure_crypto_provider();

    let mut client_crypto = if security.verify_server_cert {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store(&security.root_certs)?)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    };

    client_crypto.alpn_protocols = security
        .alpn_protocols
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();

    Ok(client_crypto)
}

fn root_store(root_certs: &[Vec<u8>]) -> TransportResult<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();

    if root_certs.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    }

    for cert_der in root_certs {
        roots
            .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
    }
    Ok(roots)
}

/// Load PEM certificates (e.g. an edge CA bundle) as DER blobs
pub fn load_root_certs(path: &Path) -> TransportResult<Vec<Vec<u8>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs.into_iter().map(|c| c.as_ref().to_vec()).collect())
}

// Certificate verifier that skips verification (INSECURE - only for testing!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetunnel_proto::Protocol;

    #[test]
    fn test_client_crypto_sets_alpn() {
        let security = TransportSecurityConfig::for_protocol(Protocol::Http2);
        let config = build_client_crypto(&security).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_invalid_root_cert_rejected() {
        let mut security = TransportSecurityConfig::default();
        security.root_certs = vec![vec![0, 1, 2, 3]];
        assert!(matches!(
            build_client_crypto(&security),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_missing_ca_file() {
        let result = load_root_certs(Path::new("/nonexistent/edge-ca.pem"));
        assert!(matches!(result, Err(TransportError::TlsError(_))));
    }
}
