//! Public TLS tunnels in front of local applications.
//!
//! A tunnel owns one TLS listener on a port from the configured range and
//! forwards every accepted connection to its application's backend. The
//! [`TunnelManager`] moves tunnels between ports without dropping
//! established connections.

pub mod config;
pub mod listener;
pub mod manager;
pub mod tls;
pub mod types;

pub use config::{ManagerSettings, RetryPolicy};
pub use listener::{DrainReport, TlsListener};
pub use manager::{RecoveryReport, TunnelManager};
pub use types::{Application, TunnelRecord, TunnelState};
