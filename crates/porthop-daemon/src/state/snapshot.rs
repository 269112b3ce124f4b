//! Persisted view of the tunnel set.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use porthop_crypto::CertificateMetadata;

use crate::error::{Error, Result};
use crate::tunnel::TunnelRecord;

/// Current snapshot format.
pub const FORMAT_VERSION: u32 = 1;

const DIGEST_LEN: usize = 32;

/// Everything needed to bring tunnels back after a restart. Never contains
/// key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format_version: u32,
    /// Strictly increasing per process; later snapshots supersede earlier ones.
    pub sequence: u64,
    pub written_at: i64,
    pub tunnels: Vec<TunnelRecord>,
    pub certificates: Vec<CertificateMetadata>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl StateSnapshot {
    pub const fn empty() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            sequence: 0,
            written_at: 0,
            tunnels: Vec::new(),
            certificates: Vec::new(),
        }
    }

    pub const fn new(
        sequence: u64,
        written_at: i64,
        tunnels: Vec<TunnelRecord>,
        certificates: Vec<CertificateMetadata>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            sequence,
            written_at,
            tunnels,
            certificates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn certificate(&self, fingerprint: &str) -> Option<&CertificateMetadata> {
        self.certificates
            .iter()
            .find(|c| c.fingerprint == fingerprint)
    }

    /// Serialize as `sha256(json) || json`.
    pub fn to_framed_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::PersistenceFailed(format!("serialize snapshot: {e}")))?;
        let digest = Sha256::digest(&json);
        let mut out = Vec::with_capacity(DIGEST_LEN + json.len());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Parse a frame written by [`to_framed_bytes`](Self::to_framed_bytes),
    /// verifying the integrity hash.
    pub fn from_framed_bytes(framed: &[u8]) -> Result<Self> {
        if framed.len() < DIGEST_LEN {
            return Err(Error::StateCorrupt(format!(
                "snapshot frame of {} bytes is truncated",
                framed.len()
            )));
        }
        let (digest, json) = framed.split_at(DIGEST_LEN);
        if Sha256::digest(json).as_slice() != digest {
            return Err(Error::StateCorrupt("snapshot integrity hash mismatch".into()));
        }
        let snapshot: Self = serde_json::from_slice(json)
            .map_err(|e| Error::StateCorrupt(format!("parse snapshot: {e}")))?;
        if snapshot.format_version > FORMAT_VERSION {
            return Err(Error::StateCorrupt(format!(
                "snapshot format {} is newer than supported {FORMAT_VERSION}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }
}
