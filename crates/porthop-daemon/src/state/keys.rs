//! Runtime secrets for the state store.
//!
//! The store root keypair is read from `store.key` once at start-up. Its
//! secret and three symmetric keys derived from it (live state, backups,
//! certificate blobs) are moved into secure memory; nothing derived here is
//! ever written to disk.

use std::path::Path;
use std::sync::Arc;

use porthop_crypto::{SecretHandle, SecureMemoryStore, StoreKeyPair, SymmetricKey, derive_key};
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Result;

const LIVE_STATE_INFO: &[u8] = b"porthop-state-live-v1";
const BACKUP_INFO: &[u8] = b"porthop-state-backup-v1";
const CERTIFICATE_INFO: &[u8] = b"porthop-certificate-blob-v1";

/// Handles to the keys that protect persisted state.
pub struct RuntimeSecrets {
    memory: Arc<SecureMemoryStore>,
    public: PublicKey,
    fingerprint: String,
    store_secret: SecretHandle,
    live: SecretHandle,
    backup: SecretHandle,
    certificates: SecretHandle,
}

impl std::fmt::Debug for RuntimeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSecrets")
            .field("store_key", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl RuntimeSecrets {
    /// Load the store keypair from `key_path` (creating it on first run) and
    /// derive the runtime keys.
    pub fn load_or_create(key_path: &Path, memory: Arc<SecureMemoryStore>) -> Result<Self> {
        let created = !key_path.exists();
        let keypair = StoreKeyPair::load_or_generate(key_path)?;
        if created {
            info!(path = %key_path.display(), fingerprint = %keypair.fingerprint(), "Generated store key");
        }
        Self::from_keypair(&keypair, memory)
    }

    pub fn from_keypair(keypair: &StoreKeyPair, memory: Arc<SecureMemoryStore>) -> Result<Self> {
        let secret = keypair.secret_bytes();
        let live = derive_key(secret.as_slice(), LIVE_STATE_INFO)?;
        let backup = derive_key(secret.as_slice(), BACKUP_INFO)?;
        let certificates = derive_key(secret.as_slice(), CERTIFICATE_INFO)?;

        Ok(Self {
            public: *keypair.public_key(),
            fingerprint: keypair.fingerprint(),
            store_secret: memory.store(secret.as_slice())?,
            live: memory.store(live.as_slice())?,
            backup: memory.store(backup.as_slice())?,
            certificates: memory.store(certificates.as_slice())?,
            memory,
        })
    }

    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Fingerprint of the store public key, for logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn store_secret(&self) -> Result<StaticSecret> {
        let bytes = self.memory.read_key(self.store_secret)?;
        Ok(StaticSecret::from(*bytes))
    }

    pub fn live_key(&self) -> Result<SymmetricKey> {
        self.symmetric(self.live)
    }

    pub fn backup_key(&self) -> Result<SymmetricKey> {
        self.symmetric(self.backup)
    }

    pub fn certificate_key(&self) -> Result<SymmetricKey> {
        self.symmetric(self.certificates)
    }

    fn symmetric(&self, handle: SecretHandle) -> Result<SymmetricKey> {
        let bytes = self.memory.read_key(handle)?;
        Ok(SymmetricKey::from_bytes(&bytes))
    }

    /// Wipe every key. Later reads fail.
    pub fn wipe(&self) {
        for handle in [self.store_secret, self.live, self.backup, self.certificates] {
            self.memory.wipe(handle);
        }
    }
}
