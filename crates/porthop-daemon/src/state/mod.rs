//! Encrypted state persistence.
//!
//! [`SecureStateStore`] owns the on-disk layout and the sealing scheme;
//! [`StateWriter`] is the only path the rest of the daemon writes through.

pub mod keys;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use keys::RuntimeSecrets;
pub use snapshot::{FORMAT_VERSION, StateSnapshot};
pub use store::{BackupEntry, SecureStateStore};
pub use writer::{StateWriter, WriteRequest, WriterSettings};
