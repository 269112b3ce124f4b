//! Daemon error types.

use porthop_crypto::CryptoError;

/// Errors raised by the tunnel, rotation and state layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No port available: {0}")]
    PortUnavailable(String),

    #[error("Port range exhausted after {attempts} attempts")]
    PortExhausted { attempts: usize },

    #[error("Certificate generation failed: {0}")]
    CertGenerationFailed(String),

    #[error("Backend {address} unreachable: {reason}")]
    BackendUnreachable { address: String, reason: String },

    #[error("Migration of '{application_key}' failed: {reason}")]
    MigrationFailed {
        application_key: String,
        reason: String,
    },

    #[error("State corrupt: {0}")]
    StateCorrupt(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Tunnel already exists: {0}")]
    TunnelExists(String),

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("Invalid tunnel state for '{application_key}': {state}")]
    InvalidState {
        application_key: String,
        state: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failures that leave the old listener authoritative and are worth
    /// retrying on the next scheduler tick.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PortUnavailable(_)
                | Self::PortExhausted { .. }
                | Self::MigrationFailed { .. }
                | Self::CertGenerationFailed(_)
                | Self::BackendUnreachable { .. }
        )
    }
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;
