//! rustls client configuration shared by direct TLS, STARTTLS and `wss://`.

use std::sync::{Arc, Once};

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

use super::BoxedStream;
use crate::error::{Error, Result};

/// Install the ring crypto provider once per process.
pub fn init_crypto_provider() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate verifier that accepts every certificate.
///
/// **DANGEROUS**: only selected by `SessionConfig::dangerous_insecure_tls`,
/// for development against self-signed servers.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client config trusting the system's native roots, or nothing at all when
/// `insecure` is set.
pub fn client_config(insecure: bool) -> Result<Arc<ClientConfig>> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(Error::Tls(
            "No system root certificates found. \
             Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Tls(format!("Failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn classify(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// Run the TLS handshake over `stream`, verifying against `tls_name`.
pub async fn upgrade(stream: BoxedStream, tls_name: &str, insecure: bool) -> Result<BoxedStream> {
    let connector = TlsConnector::from(client_config(insecure)?);
    let server_name = ServerName::try_from(tls_name.to_string())
        .map_err(|e| Error::Tls(format!("Invalid server name '{}': {}", tls_name, e)))?;

    let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
        let classification = classify(&e.to_string());
        error!(tls_name, error = %e, error_class = classification, "TLS handshake failed");
        Error::Tls(format!(
            "TLS handshake failed with {} ({}): {}",
            tls_name, classification, e
        ))
    })?;
    Ok(Box::new(tls_stream))
}
