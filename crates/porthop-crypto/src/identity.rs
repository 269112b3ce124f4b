//! Store root keypair management.
//!
//! The state store seals every snapshot to a long-lived X25519 keypair.
//! Its secret is kept in a single owner-only key file; everything else the
//! process needs at runtime is derived from it and held in secure memory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const SECRET_LEN: usize = 32;

#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o600;

/// An X25519 keypair that snapshots are sealed to.
pub struct StoreKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for StoreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl From<StaticSecret> for StoreKeyPair {
    fn from(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl StoreKeyPair {
    pub fn generate() -> Self {
        StaticSecret::random_from_rng(OsRng).into()
    }

    /// Rebuild a keypair from its raw secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: Zeroizing<[u8; SECRET_LEN]> =
            Zeroizing::new(bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SECRET_LEN,
                actual: bytes.len(),
            })?);
        Ok(StaticSecret::from(*raw).into())
    }

    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw secret scalar, wiped when the returned buffer drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }

    /// Write the secret to a new key file at `path`.
    ///
    /// On Unix the file is created with mode 0600, so the secret is never
    /// visible to other users. An existing file is left untouched and the
    /// call fails with `AlreadyExists`.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = create_owner_only(path)?;
        file.write_all(self.secret_bytes().as_slice())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a keypair back from a key file written by [`Self::save_to_file`].
    ///
    /// Refuses files that other users could read.
    pub fn load_from_file(path: &Path) -> Result<Self, CryptoError> {
        let mut file = File::open(path)?;
        ensure_owner_only(&file)?;
        let mut raw = Zeroizing::new([0u8; SECRET_LEN]);
        file.read_exact(raw.as_mut_slice())?;
        Self::from_secret_bytes(raw.as_slice())
    }

    /// Load the key file at `path`, creating it with a fresh keypair when
    /// it does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        let keypair = Self::generate();
        keypair.save_to_file(path)?;
        Ok(keypair)
    }
}

fn create_owner_only(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(KEY_FILE_MODE);
    }
    options.open(path)
}

#[cfg(unix)]
fn ensure_owner_only(file: &File) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = file.metadata()?.permissions().mode() & 0o777;
    if mode != KEY_FILE_MODE {
        return Err(CryptoError::IoError(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("store key file has insecure permissions {mode:o}, expected 600"),
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_only(_file: &File) -> Result<(), CryptoError> {
    Ok(())
}

/// Colon-separated SHA-256 fingerprint of arbitrary bytes (public keys,
/// certificate DER).
pub fn fingerprint_of(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&hex::encode([*byte]));
    }
    out
}
