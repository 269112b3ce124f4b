//! Two-layer envelope encryption for persisted state.
//!
//! Layer 1 is ChaCha20-Poly1305 under a symmetric key derived from the
//! runtime secret. Layer 2 is a sealed box addressed to the store keypair:
//! a fresh X25519 ephemeral key per message, ECDH with the recipient's
//! static public key, HKDF-SHA256 to a one-shot ChaCha20-Poly1305 key.
//!
//! Wire layout:
//!
//! ```text
//! layer 1:  nonce[12] || ciphertext+tag
//! layer 2:  MAGIC[4] || VERSION[1] || ephemeral_public[32] || nonce[12] || ciphertext+tag
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"porthop-envelope-hkdf-salt-v1";

/// HKDF info prefix for sealed-box keys.
const SEALED_BOX_INFO: &[u8] = b"porthop-sealed-box-v1";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

const MAGIC: &[u8; 4] = b"PHSB";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = MAGIC.len() + 1 + 32 + NONCE_SIZE;

/// Derive a 32-byte key from input key material via HKDF-SHA256.
///
/// Different `info` strings yield independent keys from the same secret.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Symmetric AEAD key (layer 1).
///
/// Nonces are random rather than counter-based: the same key is re-derived
/// after every restart, so a counter would repeat.
pub struct SymmetricKey {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

impl SymmetricKey {
    pub fn from_bytes(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt into `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = random_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` frame produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, framed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if framed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "frame of {} bytes is shorter than nonce and tag",
                framed.len()
            )));
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

fn sealed_box_cipher(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<ChaCha20Poly1305, CryptoError> {
    let mut info = Vec::with_capacity(SEALED_BOX_INFO.len() + 64);
    info.extend_from_slice(SEALED_BOX_INFO);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);
    let key = derive_key(shared, &info)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
}

/// Seal `plaintext` to `recipient` (layer 2).
pub fn seal_to(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let cipher = sealed_box_cipher(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )?;

    let nonce_bytes = random_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed box with the recipient's static secret.
pub fn open_sealed(secret: &StaticSecret, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < HEADER_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed(format!(
            "sealed box of {} bytes is truncated",
            sealed.len()
        )));
    }
    if &sealed[..4] != MAGIC {
        return Err(CryptoError::DecryptionFailed("bad sealed box magic".into()));
    }
    if sealed[4] != VERSION {
        return Err(CryptoError::DecryptionFailed(format!(
            "unsupported sealed box version {}",
            sealed[4]
        )));
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&sealed[5..37]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let nonce = &sealed[37..HEADER_SIZE];
    let ciphertext = &sealed[HEADER_SIZE..];

    let recipient_public = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let cipher = sealed_box_cipher(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_public.as_bytes(),
    )?;
    ephemeral_bytes.zeroize();

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Apply both layers: symmetric under `layer_key`, then sealed to `recipient`.
pub fn seal_layered(
    layer_key: &SymmetricKey,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let inner = layer_key.encrypt(plaintext)?;
    seal_to(recipient, &inner)
}

/// Reverse [`seal_layered`].
pub fn open_layered(
    layer_key: &SymmetricKey,
    secret: &StaticSecret,
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let inner = open_sealed(secret, sealed)?;
    layer_key.decrypt(&inner)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn derive_key_depends_on_info() {
        let ikm = [42u8; 32];
        let a = derive_key(&ikm, b"state").unwrap();
        let b = derive_key(&ikm, b"backup").unwrap();
        let a2 = derive_key(&ikm, b"state").unwrap();
        assert_ne!(*a, *b);
        assert_eq!(*a, *a2);
    }

    #[test]
    fn symmetric_roundtrip() {
        let key = SymmetricKey::from_bytes(&[1u8; 32]);
        let framed = key.encrypt(b"tunnel table").unwrap();
        assert_eq!(framed.len(), NONCE_SIZE + b"tunnel table".len() + TAG_SIZE);
        assert_eq!(key.decrypt(&framed).unwrap().as_slice(), b"tunnel table");
    }

    #[test]
    fn symmetric_nonces_are_random() {
        let key = SymmetricKey::from_bytes(&[1u8; 32]);
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn symmetric_wrong_key_fails() {
        let framed = SymmetricKey::from_bytes(&[1u8; 32])
            .encrypt(b"x")
            .unwrap();
        let result = SymmetricKey::from_bytes(&[2u8; 32]).decrypt(&framed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn symmetric_truncated_frame_fails() {
        let key = SymmetricKey::from_bytes(&[1u8; 32]);
        assert!(key.decrypt(&[0u8; NONCE_SIZE]).is_err());
    }

    #[test]
    fn sealed_box_roundtrip() {
        let (secret, public) = keypair();
        let sealed = seal_to(&public, b"hello").unwrap();
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(open_sealed(&secret, &sealed).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn sealed_box_uses_fresh_ephemeral_key() {
        let (_, public) = keypair();
        let a = seal_to(&public, b"hello").unwrap();
        let b = seal_to(&public, b"hello").unwrap();
        assert_ne!(a[5..37], b[5..37]);
    }

    #[test]
    fn sealed_box_wrong_recipient_fails() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();
        let sealed = seal_to(&public, b"hello").unwrap();
        assert!(open_sealed(&other_secret, &sealed).is_err());
    }

    #[test]
    fn sealed_box_rejects_bad_header() {
        let (secret, public) = keypair();
        let mut sealed = seal_to(&public, b"hello").unwrap();
        sealed[0] = b'X';
        assert!(open_sealed(&secret, &sealed).is_err());

        let mut sealed = seal_to(&public, b"hello").unwrap();
        sealed[4] = 99;
        assert!(open_sealed(&secret, &sealed).is_err());

        assert!(open_sealed(&secret, &[0u8; 10]).is_err());
    }

    #[test]
    fn layered_roundtrip_and_tamper_detection() {
        let (secret, public) = keypair();
        let key = SymmetricKey::from_bytes(&[5u8; 32]);
        let mut sealed = seal_layered(&key, &public, b"snapshot").unwrap();
        assert_eq!(
            open_layered(&key, &secret, &sealed).unwrap().as_slice(),
            b"snapshot"
        );

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open_layered(&key, &secret, &sealed).is_err());
    }

    #[test]
    fn layered_requires_both_keys() {
        let (secret, public) = keypair();
        let key = SymmetricKey::from_bytes(&[5u8; 32]);
        let sealed = seal_layered(&key, &public, b"snapshot").unwrap();

        let wrong_layer = SymmetricKey::from_bytes(&[6u8; 32]);
        assert!(open_layered(&wrong_layer, &secret, &sealed).is_err());

        let (other_secret, _) = keypair();
        assert!(open_layered(&key, &other_secret, &sealed).is_err());
    }
}
