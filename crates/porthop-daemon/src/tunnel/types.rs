//! Tunnel records and the applications they front.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use porthop_core::config::ApplicationConfig;

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Pending,
    Active,
    Rotating,
    Draining,
    Closed,
}

impl TunnelState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application a tunnel can be opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Application {
    /// Stable identifier, e.g. a configured name or the backend port.
    pub application_key: String,
    pub backend_address: SocketAddr,
    pub pid: Option<u32>,
}

impl Application {
    pub fn new(application_key: impl Into<String>, backend_address: SocketAddr) -> Self {
        Self {
            application_key: application_key.into(),
            backend_address,
            pid: None,
        }
    }

    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl From<&ApplicationConfig> for Application {
    fn from(config: &ApplicationConfig) -> Self {
        Self {
            application_key: config.key.clone(),
            backend_address: config.backend,
            pid: config.pid,
        }
    }
}

/// Published view of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub application_key: String,
    pub backend_address: SocketAddr,
    #[serde(default)]
    pub pid: Option<u32>,
    pub public_port: u16,
    /// Set only while `Rotating`.
    #[serde(default)]
    pub previous_port: Option<u16>,
    pub state: TunnelState,
    pub certificate_fingerprint: String,
    pub created_at: i64,
    pub last_rotated_at: i64,
    pub rotation_count: u64,
}

impl TunnelRecord {
    /// A record for an application whose tunnel is still being set up.
    pub fn pending(application: &Application, now: i64) -> Self {
        Self {
            application_key: application.application_key.clone(),
            backend_address: application.backend_address,
            pid: application.pid,
            public_port: 0,
            previous_port: None,
            state: TunnelState::Pending,
            certificate_fingerprint: String::new(),
            created_at: now,
            last_rotated_at: now,
            rotation_count: 0,
        }
    }

    pub fn application(&self) -> Application {
        Application {
            application_key: self.application_key.clone(),
            backend_address: self.backend_address,
            pid: self.pid,
        }
    }

    /// Seconds since the last rotation (or since creation).
    pub const fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_rotated_at)
    }

    /// Whether an `Active` record has gone at least `interval_secs` without
    /// a rotation.
    pub const fn is_due(&self, now: i64, interval_secs: u64) -> bool {
        let interval = if interval_secs > i64::MAX as u64 {
            i64::MAX
        } else {
            interval_secs as i64
        };
        matches!(self.state, TunnelState::Active) && self.age(now) >= interval
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn app() -> Application {
        Application::new("web", "127.0.0.1:8080".parse().unwrap())
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&TunnelState::Rotating).unwrap();
        assert_eq!(json, "\"rotating\"");
        let back: TunnelState = serde_json::from_str("\"draining\"").unwrap();
        assert_eq!(back, TunnelState::Draining);
    }

    #[test]
    fn due_only_when_active_and_old_enough() {
        let mut record = TunnelRecord::pending(&app(), 1_000);
        assert!(!record.is_due(2_000, 10));

        record.state = TunnelState::Active;
        assert!(!record.is_due(1_005, 10));
        assert!(record.is_due(1_010, 10));

        record.state = TunnelState::Rotating;
        assert!(!record.is_due(5_000, 10));
    }

    #[test]
    fn record_roundtrips_application() {
        let application = app().with_pid(42);
        let record = TunnelRecord::pending(&application, 0);
        assert_eq!(record.application(), application);
    }
}
