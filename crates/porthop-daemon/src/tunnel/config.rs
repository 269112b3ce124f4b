//! Tunnel manager settings.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use porthop_core::Config;

/// Runtime knobs for [`TunnelManager`](super::TunnelManager).
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Address public listeners bind to.
    pub bind_address: IpAddr,

    /// How long a retired listener keeps serving in-flight connections.
    pub grace_period: Duration,

    /// Validity of newly issued certificates.
    pub certificate_validity: Duration,

    /// Replace a certificate on migration once it expires within this window.
    pub renewal_threshold: Duration,

    /// Replace the certificate on every migration.
    pub rotate_on_migrate: bool,

    /// TLS self-probe the new listener before switching to it.
    pub verify_new_listener: bool,

    pub certificate_issue_timeout: Duration,
    pub backend_probe_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace_period: Duration::from_secs(5),
            certificate_validity: Duration::from_secs(30 * 24 * 60 * 60),
            renewal_threshold: Duration::from_secs(24 * 60 * 60),
            rotate_on_migrate: false,
            verify_new_listener: true,
            certificate_issue_timeout: Duration::from_secs(5),
            backend_probe_timeout: Duration::from_secs(2),
        }
    }
}

impl ManagerSettings {
    pub const fn from_config(config: &Config) -> Self {
        Self {
            bind_address: config.tunnels.bind_address,
            grace_period: config.grace_period(),
            certificate_validity: config.certificate_validity(),
            renewal_threshold: config.renewal_threshold(),
            rotate_on_migrate: config.certificates.rotate_on_migrate,
            verify_new_listener: config.tunnels.verify_new_listener,
            certificate_issue_timeout: config.certificate_issue_timeout(),
            backend_probe_timeout: config.backend_probe_timeout(),
        }
    }

    /// Address a local client uses to reach a listener bound to
    /// `bind_address`. Wildcard binds are probed over loopback.
    pub const fn probe_address(&self) -> IpAddr {
        if self.bind_address.is_unspecified() {
            match self.bind_address {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            }
        } else {
            self.bind_address
        }
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a given failed attempt (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether attempt number `attempt` (0-indexed) may run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_attempts, Some(5));
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = RetryPolicy::default();

        // 200ms, 400ms, 800ms, 1.6s, 3.2s, 5s (capped)
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(3200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn retry_with_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn retry_unlimited() {
        let policy = RetryPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.tunnels.grace_period_ms = 250;
        config.certificates.rotate_on_migrate = true;
        let settings = ManagerSettings::from_config(&config);
        assert_eq!(settings.grace_period, Duration::from_millis(250));
        assert!(settings.rotate_on_migrate);
    }

    #[test]
    fn wildcard_bind_is_probed_over_loopback() {
        let settings = ManagerSettings {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..Default::default()
        };
        assert_eq!(settings.probe_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
