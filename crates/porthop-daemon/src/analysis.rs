//! Advisory analysis of tunnels.
//!
//! Analyzers only ever see [`TunnelMetadata`], never payload or key
//! material, and their output is informational: nothing in the tunnel
//! lifecycle waits on or is gated by an advisory.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use porthop_crypto::CertificateMetadata;

use crate::tunnel::{TunnelRecord, TunnelState};

/// Backend ports that usually carry administrative or data-store traffic.
const SENSITIVE_PORTS: &[(u16, &str)] = &[
    (22, "SSH"),
    (23, "Telnet"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (6379, "Redis"),
    (9200, "Elasticsearch"),
    (27017, "MongoDB"),
];

/// Metadata-only view of a tunnel handed to analyzers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelMetadata {
    pub application_key: String,
    pub backend_address: SocketAddr,
    pub pid: Option<u32>,
    pub public_port: u16,
    pub state: TunnelState,
    /// Seconds since the port last changed.
    pub port_age_secs: i64,
    pub rotation_count: u64,
    pub rotation_interval_secs: u64,
    pub auto_rotation: bool,
    /// Seconds until the certificate expires; negative once expired.
    pub certificate_expires_in_secs: Option<i64>,
}

impl TunnelMetadata {
    pub fn from_record(
        record: &TunnelRecord,
        certificate: Option<&CertificateMetadata>,
        now: i64,
        rotation_interval: Duration,
        auto_rotation: bool,
    ) -> Self {
        Self {
            application_key: record.application_key.clone(),
            backend_address: record.backend_address,
            pid: record.pid,
            public_port: record.public_port,
            state: record.state,
            port_age_secs: record.age(now),
            rotation_count: record.rotation_count,
            rotation_interval_secs: rotation_interval.as_secs(),
            auto_rotation,
            certificate_expires_in_secs: certificate.map(|c| c.expires_at.saturating_sub(now)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelPolicy {
    pub should_tunnel: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advisory {
    pub risk_level: RiskLevel,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
    pub tunnel_policy: TunnelPolicy,
}

pub trait Analyzer: Send + Sync {
    fn analyze(&self, metadata: &TunnelMetadata) -> Advisory;
}

/// Local rule-based analyzer.
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    /// Certificates expiring within this window are flagged.
    pub expiry_warning: Duration,
    /// A port older than this many rotation intervals is flagged.
    pub stale_factor: u64,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self {
            expiry_warning: Duration::from_secs(24 * 60 * 60),
            stale_factor: 3,
        }
    }
}

struct Findings {
    risk: RiskLevel,
    concerns: Vec<String>,
    recommendations: Vec<String>,
}

impl Findings {
    fn flag(&mut self, risk: RiskLevel, concern: String, recommendation: &str) {
        self.risk = self.risk.max(risk);
        self.concerns.push(concern);
        if !recommendation.is_empty() {
            self.recommendations.push(recommendation.to_string());
        }
    }
}

impl Analyzer for HeuristicAnalyzer {
    fn analyze(&self, m: &TunnelMetadata) -> Advisory {
        let mut findings = Findings {
            risk: RiskLevel::Low,
            concerns: Vec::new(),
            recommendations: Vec::new(),
        };

        let exposed = !m.backend_address.ip().is_loopback();
        if exposed {
            findings.flag(
                RiskLevel::High,
                format!(
                    "Backend {} listens beyond loopback and can be reached without the tunnel",
                    m.backend_address
                ),
                "Bind the application to 127.0.0.1 so the tunnel is its only entry point",
            );
        }

        if let Some((_, service)) = SENSITIVE_PORTS
            .iter()
            .find(|(port, _)| *port == m.backend_address.port())
        {
            findings.flag(
                RiskLevel::Medium,
                format!("Backend port {} usually serves {service}", m.backend_address.port()),
                "Keep the rotation interval short for administrative services",
            );
        }

        if !m.auto_rotation {
            findings.flag(
                RiskLevel::Medium,
                "Automatic port rotation is disabled".into(),
                "Re-enable auto rotation with the 't' command",
            );
        }

        let stale_after = m.rotation_interval_secs.saturating_mul(self.stale_factor);
        if stale_after > 0 && u64::try_from(m.port_age_secs).unwrap_or(0) > stale_after {
            findings.flag(
                RiskLevel::Medium,
                format!(
                    "Public port {} unchanged for {}s",
                    m.public_port, m.port_age_secs
                ),
                "Force a rotation with 'r <key>'",
            );
        }

        match m.certificate_expires_in_secs {
            Some(left) if left <= 0 => findings.flag(
                RiskLevel::High,
                "Tunnel certificate has expired".into(),
                "Rotate the tunnel to issue a fresh certificate",
            ),
            Some(left) if u64::try_from(left).unwrap_or(0) < self.expiry_warning.as_secs() => {
                findings.flag(
                    RiskLevel::Medium,
                    format!("Tunnel certificate expires in {left}s"),
                    "Rotate the tunnel to renew its certificate",
                );
            }
            Some(_) => {}
            None => findings.flag(
                RiskLevel::Low,
                "No certificate is attached to the tunnel".into(),
                "",
            ),
        }

        if !matches!(m.state, TunnelState::Active) {
            findings.flag(
                RiskLevel::Low,
                format!("Tunnel is {}", m.state),
                "",
            );
        }

        let tunnel_policy = if exposed {
            TunnelPolicy {
                should_tunnel: false,
                reason: "The backend is already exposed directly; tunneling adds little until it is bound to loopback".into(),
            }
        } else {
            TunnelPolicy {
                should_tunnel: true,
                reason: "Loopback-only backend; the rotating tunnel is its only public path".into(),
            }
        };

        Advisory {
            risk_level: findings.risk,
            concerns: findings.concerns,
            recommendations: findings.recommendations,
            tunnel_policy,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn metadata(backend: &str) -> TunnelMetadata {
        TunnelMetadata {
            application_key: "web".into(),
            backend_address: backend.parse().unwrap(),
            pid: None,
            public_port: 5001,
            state: TunnelState::Active,
            port_age_secs: 5,
            rotation_count: 2,
            rotation_interval_secs: 10,
            auto_rotation: true,
            certificate_expires_in_secs: Some(30 * 24 * 3600),
        }
    }

    #[test]
    fn healthy_loopback_tunnel_is_low_risk() {
        let advisory = HeuristicAnalyzer::default().analyze(&metadata("127.0.0.1:8080"));
        assert_eq!(advisory.risk_level, RiskLevel::Low);
        assert!(advisory.concerns.is_empty());
        assert!(advisory.tunnel_policy.should_tunnel);
    }

    #[test]
    fn exposed_backend_is_high_risk() {
        let advisory = HeuristicAnalyzer::default().analyze(&metadata("0.0.0.0:8080"));
        assert_eq!(advisory.risk_level, RiskLevel::High);
        assert!(!advisory.tunnel_policy.should_tunnel);
        assert_eq!(advisory.recommendations.len(), 1);
    }

    #[test]
    fn stale_port_and_disabled_rotation_are_flagged() {
        let mut m = metadata("127.0.0.1:8080");
        m.auto_rotation = false;
        m.port_age_secs = 31;
        let advisory = HeuristicAnalyzer::default().analyze(&m);
        assert_eq!(advisory.risk_level, RiskLevel::Medium);
        assert_eq!(advisory.concerns.len(), 2);
    }

    #[test]
    fn certificate_expiry_escalates() {
        let mut m = metadata("127.0.0.1:8080");
        m.certificate_expires_in_secs = Some(600);
        assert_eq!(HeuristicAnalyzer::default().analyze(&m).risk_level, RiskLevel::Medium);
        m.certificate_expires_in_secs = Some(-1);
        assert_eq!(HeuristicAnalyzer::default().analyze(&m).risk_level, RiskLevel::High);
    }

    #[test]
    fn sensitive_backend_port_is_named() {
        let advisory = HeuristicAnalyzer::default().analyze(&metadata("127.0.0.1:5432"));
        assert_eq!(advisory.risk_level, RiskLevel::Medium);
        assert!(advisory.concerns[0].contains("PostgreSQL"));
    }

    #[test]
    fn advisory_serializes_with_snake_case_keys() {
        let advisory = HeuristicAnalyzer::default().analyze(&metadata("127.0.0.1:8080"));
        let json = serde_json::to_value(&advisory).unwrap();
        assert_eq!(json["risk_level"], "low");
        assert_eq!(json["tunnel_policy"]["should_tunnel"], true);
    }

    #[test]
    fn metadata_from_record() {
        let app = crate::tunnel::Application::new("web", "127.0.0.1:8080".parse().unwrap());
        let mut record = TunnelRecord::pending(&app, 1_000);
        record.state = TunnelState::Active;
        record.public_port = 5005;
        let m = TunnelMetadata::from_record(&record, None, 1_040, Duration::from_secs(10), true);
        assert_eq!(m.port_age_secs, 40);
        assert_eq!(m.rotation_interval_secs, 10);
        assert_eq!(m.certificate_expires_in_secs, None);
    }
}
