//! rustls configuration for tunnel listeners and pinned-fingerprint probes.
//!
//! Tunnel certificates are self-signed, so clients (and the manager's own
//! self-probe) authenticate a listener by the SHA-256 fingerprint of its
//! leaf certificate rather than through a CA chain. Handshake signatures
//! are still verified with the provider's algorithms.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, ring, verify_tls12_signature,
    verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use porthop_crypto::fingerprint_of;

/// Server name presented by probes; tunnel certificates carry it as a SAN.
pub const PROBE_SERVER_NAME: &str = "localhost";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build a listener configuration for one certificate and its PKCS#8 key.
pub fn server_config(
    certificate_der: &[u8],
    private_key_der: &[u8],
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let cert = CertificateDer::from(certificate_der.to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key_der.to_vec()));
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    Ok(Arc::new(config))
}

/// Accepts exactly one leaf certificate, identified by fingerprint.
#[derive(Debug)]
pub struct PinnedFingerprint {
    fingerprint: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedFingerprint {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            algorithms: ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint_of(end_entity.as_ref());
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(expected = %self.fingerprint, presented = %presented, "Fingerprint mismatch");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client configuration that trusts only the certificate with `fingerprint`.
pub fn pinned_client_config(fingerprint: &str) -> Result<Arc<ClientConfig>, rustls::Error> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedFingerprint::new(fingerprint)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Open a TLS connection to `addr` that only succeeds if the listener
/// presents the certificate with `fingerprint`.
pub async fn connect_pinned(
    addr: SocketAddr,
    fingerprint: &str,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = pinned_client_config(fingerprint).map_err(io::Error::other)?;
    let connector = TlsConnector::from(config);
    let name = ServerName::try_from(PROBE_SERVER_NAME)
        .map_err(io::Error::other)?
        .to_owned();
    let tcp = TcpStream::connect(addr).await?;
    connector.connect(name, tcp).await
}

/// Complete a pinned handshake against `addr` within `timeout`.
pub async fn probe(addr: SocketAddr, fingerprint: &str, timeout: Duration) -> io::Result<()> {
    let handshake = async {
        let mut stream = connect_pinned(addr, fingerprint).await?;
        // Best effort close_notify; the handshake already proved the listener.
        let _ = stream.shutdown().await;
        Ok(())
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS probe timed out"))?
}
