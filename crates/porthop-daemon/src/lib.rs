//! `PortHop` Daemon Library
//!
//! Core functionality for the porthop daemon:
//! - TLS-terminating tunnels in front of local applications
//! - Make-before-break relocation of each tunnel's public port
//! - Per-tunnel certificate issuance and retirement
//! - Encrypted, atomic, backed-up state persistence
//! - Discovery reconciliation, advisory analysis and a line-oriented control surface

pub mod analysis;
pub mod control;
pub mod discovery;
pub mod error;
pub mod rotation;
pub mod state;
pub mod tunnel;

pub use error::{Error, Result};
