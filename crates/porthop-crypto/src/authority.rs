//! Self-signed certificate issuance for tunnel listeners.
//!
//! Each tunnel identity gets its own ECDSA P-256 key and a self-signed
//! certificate valid for `localhost` and `127.0.0.1`. Clients authenticate
//! the listener by pinning the certificate fingerprint, so no chain of
//! trust is involved.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DnType, KeyPair, SerialNumber};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::fingerprint_of;

/// Subject alternative names every tunnel certificate carries.
pub const TUNNEL_SUBJECT_ALT_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

const SERIAL_LEN: usize = 16;

/// Public facts about an issued certificate. Safe to persist in clear
/// inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    pub identity: String,
    /// Hex-encoded serial number.
    pub serial: String,
    /// SHA-256 of the certificate DER, colon-separated hex.
    pub fingerprint: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl CertificateMetadata {
    /// True if the certificate expires within `threshold` of `now` (or has
    /// already expired).
    pub fn expires_within(&self, now: i64, threshold: Duration) -> bool {
        let threshold = i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX);
        self.expires_at.saturating_sub(now) <= threshold
    }

    /// Constant-time fingerprint comparison.
    pub fn matches_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprint
            .as_bytes()
            .ct_eq(fingerprint.as_bytes())
            .into()
    }
}

/// A certificate together with its private key.
pub struct CertificateMaterial {
    pub metadata: CertificateMetadata,
    pub certificate_der: Vec<u8>,
    /// PKCS#8 DER private key.
    pub private_key_der: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("metadata", &self.metadata)
            .field("certificate_der_len", &self.certificate_der.len())
            .field("private_key_der", &"[REDACTED]")
            .finish()
    }
}

impl CertificateMaterial {
    /// Reassemble material from persisted parts, checking that the
    /// certificate still hashes to the recorded fingerprint.
    pub fn from_parts(
        metadata: CertificateMetadata,
        certificate_der: Vec<u8>,
        private_key_der: Zeroizing<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        if fingerprint_of(&certificate_der) != metadata.fingerprint {
            return Err(CryptoError::CertGeneration(format!(
                "certificate for {} does not match fingerprint {}",
                metadata.identity, metadata.fingerprint
            )));
        }
        Ok(Self {
            metadata,
            certificate_der,
            private_key_der,
        })
    }
}

/// Issues self-signed certificates with a fixed validity period.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    validity: Duration,
}

impl CertificateAuthority {
    pub const fn new(validity: Duration) -> Self {
        Self { validity }
    }

    pub const fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a fresh key and certificate for `identity`, valid from now.
    pub fn issue(&self, identity: &str) -> Result<CertificateMaterial, CryptoError> {
        issue_at(identity, self.validity, unix_now())
    }

    /// Replace `old` with a new key and serial for the same identity.
    pub fn rotate(&self, old: &CertificateMetadata) -> Result<CertificateMaterial, CryptoError> {
        let material = self.issue(&old.identity)?;
        debug!(
            identity = %old.identity,
            old = %old.fingerprint,
            new = %material.metadata.fingerprint,
            "Rotated tunnel certificate"
        );
        Ok(material)
    }
}

/// Issue a certificate whose validity window starts at `now` (unix seconds).
pub fn issue_at(
    identity: &str,
    validity: Duration,
    now: i64,
) -> Result<CertificateMaterial, CryptoError> {
    if identity.trim().is_empty() {
        return Err(CryptoError::CertGeneration(
            "certificate identity must not be empty".into(),
        ));
    }
    if validity.as_secs() == 0 {
        return Err(CryptoError::CertGeneration(
            "certificate validity must be at least one second".into(),
        ));
    }
    let validity_secs = i64::try_from(validity.as_secs())
        .map_err(|_| CryptoError::CertGeneration("certificate validity too large".into()))?;
    let expires_at = now
        .checked_add(validity_secs)
        .ok_or_else(|| CryptoError::CertGeneration("certificate validity too large".into()))?;

    let gen_err = |e: rcgen::Error| CryptoError::CertGeneration(e.to_string());
    let time_err = |e: time::error::ComponentRange| CryptoError::CertGeneration(e.to_string());

    let mut params = CertificateParams::new(
        TUNNEL_SUBJECT_ALT_NAMES
            .iter()
            .map(|s| (*s).to_string())
            .collect::<Vec<_>>(),
    )
    .map_err(gen_err)?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("porthop tunnel {identity}"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, "porthop");
    params.not_before = OffsetDateTime::from_unix_timestamp(now).map_err(time_err)?;
    params.not_after = OffsetDateTime::from_unix_timestamp(expires_at).map_err(time_err)?;

    let serial = random_serial();
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let key_pair = KeyPair::generate().map_err(gen_err)?;
    let cert = params.self_signed(&key_pair).map_err(gen_err)?;

    let certificate_der = cert.der().to_vec();
    let metadata = CertificateMetadata {
        identity: identity.to_string(),
        serial: hex::encode(serial),
        fingerprint: fingerprint_of(&certificate_der),
        issued_at: now,
        expires_at,
    };

    Ok(CertificateMaterial {
        metadata,
        certificate_der,
        private_key_der: Zeroizing::new(key_pair.serialize_der()),
    })
}

/// 16 random bytes with the high bit cleared (positive) and the next bit
/// set (no leading zero octet).
fn random_serial() -> [u8; SERIAL_LEN] {
    let mut serial = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x40;
    serial
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn issue_produces_consistent_metadata() {
        let ca = CertificateAuthority::new(DAY);
        let material = ca.issue("app-8080").unwrap();

        assert_eq!(material.metadata.identity, "app-8080");
        assert_eq!(
            material.metadata.fingerprint,
            fingerprint_of(&material.certificate_der)
        );
        assert_eq!(
            material.metadata.expires_at - material.metadata.issued_at,
            86_400
        );
        assert_eq!(material.metadata.serial.len(), SERIAL_LEN * 2);
        assert!(!material.private_key_der.is_empty());
    }

    #[test]
    fn serial_is_positive() {
        for _ in 0..16 {
            let serial = random_serial();
            assert_eq!(serial[0] & 0x80, 0);
            assert_ne!(serial[0], 0);
        }
    }

    #[test]
    fn zero_validity_is_rejected() {
        let err = issue_at("app", Duration::ZERO, unix_now()).unwrap_err();
        assert!(matches!(err, CryptoError::CertGeneration(_)));
    }

    #[test]
    fn empty_identity_is_rejected() {
        let err = CertificateAuthority::new(DAY).issue("  ").unwrap_err();
        assert!(matches!(err, CryptoError::CertGeneration(_)));
    }

    #[test]
    fn rotate_keeps_identity_and_changes_key() {
        let ca = CertificateAuthority::new(DAY);
        let first = ca.issue("app-9000").unwrap();
        let second = ca.rotate(&first.metadata).unwrap();

        assert_eq!(second.metadata.identity, first.metadata.identity);
        assert_ne!(second.metadata.serial, first.metadata.serial);
        assert_ne!(second.metadata.fingerprint, first.metadata.fingerprint);
        assert_ne!(*second.private_key_der, *first.private_key_der);
    }

    #[test]
    fn expires_within_threshold() {
        let material = issue_at("app", DAY, 1_000).unwrap();
        let meta = &material.metadata;

        assert!(!meta.expires_within(1_000, Duration::from_secs(3_600)));
        assert!(meta.expires_within(1_000 + 86_400 - 60, Duration::from_secs(3_600)));
        assert!(meta.expires_within(1_000 + 86_400, Duration::ZERO));
    }

    #[test]
    fn from_parts_rejects_mismatched_certificate() {
        let material = CertificateAuthority::new(DAY).issue("app").unwrap();
        let mut tampered = material.certificate_der.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;

        assert!(
            CertificateMaterial::from_parts(
                material.metadata.clone(),
                tampered,
                material.private_key_der.clone(),
            )
            .is_err()
        );
        assert!(
            CertificateMaterial::from_parts(
                material.metadata.clone(),
                material.certificate_der.clone(),
                material.private_key_der.clone(),
            )
            .is_ok()
        );
    }

    #[test]
    fn fingerprint_comparison() {
        let material = CertificateAuthority::new(DAY).issue("app").unwrap();
        let fp = material.metadata.fingerprint.clone();
        assert!(material.metadata.matches_fingerprint(&fp));
        assert!(!material.metadata.matches_fingerprint("00:11"));
    }

    #[test]
    fn debug_redacts_private_key() {
        let material = CertificateAuthority::new(DAY).issue("app").unwrap();
        let out = format!("{material:?}");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains(&hex::encode(&*material.private_key_der)));
    }
}
