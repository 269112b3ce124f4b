//! `PortHop` secret-handling primitives
//!
//! Everything the daemon needs to keep tunnel secrets out of clear-text
//! storage and out of swap.
//!
//! ## Building blocks
//!
//! - **Secure memory**: fixed-capacity, page-locked regions addressed by handle
//! - **Envelope**: ChaCha20-Poly1305 layer + X25519 sealed box (ephemeral ECDH → HKDF-SHA256)
//! - **Store key**: long-lived X25519 keypair that state snapshots are sealed to
//! - **Authority**: per-tunnel self-signed ECDSA P-256 certificates

pub mod authority;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod secure_memory;

pub use authority::{CertificateAuthority, CertificateMaterial, CertificateMetadata, unix_now};
pub use envelope::{SymmetricKey, derive_key, open_layered, open_sealed, seal_layered, seal_to};
pub use error::CryptoError;
pub use identity::{StoreKeyPair, fingerprint_of};
#[cfg(any(test, feature = "test-utils"))]
pub use secure_memory::unlocked_store;
pub use secure_memory::{MemoryLocker, NoopLocker, PlatformLocker, SecretHandle, SecureMemoryStore};
