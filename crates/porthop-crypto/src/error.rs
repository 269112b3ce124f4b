//! Crypto error types.

/// Errors from cryptographic and secret-handling operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Certificate generation failed: {0}")]
    CertGeneration(String),

    #[error("Unknown or wiped secret handle {0}")]
    UnknownHandle(u64),

    #[error("Secret of {actual} bytes does not fit region of {capacity} bytes")]
    SecretTooLarge { capacity: usize, actual: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
