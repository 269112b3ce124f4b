//! Configuration resolution for `PortHop`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/porthop/config.toml)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`PORTHOP_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete `PortHop` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub tunnels: TunnelsConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub certificates: CertificateConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Statically configured applications to protect.
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

/// Listener-side tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelsConfig {
    /// Address public listeners bind to.
    pub bind_address: IpAddr,
    /// How long in-flight connections may keep using a retired port.
    pub grace_period_ms: u64,
    /// Drain deadline used when the daemon shuts down.
    pub shutdown_grace_ms: u64,
    /// Run a pinned TLS handshake against a new listener before retiring the old one.
    pub verify_new_listener: bool,
}

impl Default for TunnelsConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace_period_ms: 5_000,
            shutdown_grace_ms: 1_000,
            verify_new_listener: true,
        }
    }
}

/// Port rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RotationConfig {
    /// Inclusive range public ports are drawn from.
    pub port_range: PortRange,
    /// Minimum age of a port before the scheduler relocates it.
    pub interval_secs: u64,
    /// How often the scheduler checks for due tunnels.
    pub tick_ms: u64,
    /// Whether periodic rotation starts enabled.
    pub auto_rotation: bool,
    /// Upper bound on probe attempts per allocation.
    pub max_port_attempts: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::new(5000, 6000),
            interval_secs: 10,
            tick_ms: 1_000,
            auto_rotation: true,
            max_port_attempts: 32,
        }
    }
}

/// Encrypted state store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// State directory. Defaults to the platform config dir.
    pub directory: Option<PathBuf>,
    /// Number of encrypted backups kept.
    pub backup_retention: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: None,
            backup_retention: 5,
        }
    }
}

/// Longest certificate lifetime accepted from configuration (ten years).
pub const MAX_VALIDITY_DAYS: u64 = 3_650;

/// Per-tunnel certificate policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CertificateConfig {
    pub validity_days: u64,
    /// Rotate the certificate during migration once it expires within this window.
    pub renewal_threshold_hours: u64,
    /// Issue a fresh certificate on every port migration.
    pub rotate_on_migrate: bool,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            validity_days: 30,
            renewal_threshold_hours: 24,
            rotate_on_migrate: false,
        }
    }
}

/// Bounded waits for operations that would otherwise hang.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub certificate_issue_ms: u64,
    pub store_write_ms: u64,
    pub backend_probe_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            certificate_issue_ms: 5_000,
            store_write_ms: 5_000,
            backend_probe_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_ms: u64,
    /// Also tunnel every local TCP listener found in `/proc/net` (Linux).
    pub auto: bool,
    /// Backend ports never picked up by automatic discovery.
    pub exclude_ports: Vec<u16>,
    /// Process names (as in `/proc/<pid>/comm`) never picked up.
    pub exclude_processes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            auto: false,
            exclude_ports: Vec::new(),
            exclude_processes: Vec::new(),
        }
    }
}

/// A statically configured application behind a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationConfig {
    /// Stable identifier for the protected application.
    pub key: String,
    /// Local address the application listens on.
    pub backend: SocketAddr,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl FromStr for ApplicationConfig {
    type Err = Error;

    /// Parse `key=host:port`, the form accepted on the command line.
    fn from_str(s: &str) -> Result<Self> {
        let (key, backend) = s
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("expected KEY=HOST:PORT, got '{s}'")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(format!("empty application key in '{s}'")));
        }
        let backend = backend
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid backend address in '{s}': {e}")))?;
        Ok(Self {
            key: key.to_string(),
            backend,
            pid: None,
        })
    }
}

/// Inclusive TCP port range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range (0 if inverted).
    pub const fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl FromStr for PortRange {
    type Err = Error;

    /// Parse `START-END`.
    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("expected START-END port range, got '{s}'")))?;
        let start = start
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid range start in '{s}': {e}")))?;
        let end = end
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid range end in '{s}': {e}")))?;
        Ok(Self::new(start, end))
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl Config {
    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        let range = self.rotation.port_range;
        if range.start == 0 || range.is_empty() {
            return Err(Error::Config(format!("invalid port range {range}")));
        }
        if self.rotation.interval_secs == 0 {
            return Err(Error::Config("rotation.interval_secs must be > 0".into()));
        }
        if self.rotation.tick_ms == 0 {
            return Err(Error::Config("rotation.tick_ms must be > 0".into()));
        }
        if self.rotation.max_port_attempts == 0 {
            return Err(Error::Config(
                "rotation.max_port_attempts must be > 0".into(),
            ));
        }
        if self.state.backup_retention == 0 {
            return Err(Error::Config("state.backup_retention must be > 0".into()));
        }
        if self.certificates.validity_days == 0 {
            return Err(Error::Config(
                "certificates.validity_days must be > 0".into(),
            ));
        }
        if self.certificates.validity_days > MAX_VALIDITY_DAYS {
            return Err(Error::Config(format!(
                "certificates.validity_days must be <= {MAX_VALIDITY_DAYS}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for app in &self.applications {
            if !seen.insert(app.key.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate application key '{}'",
                    app.key
                )));
            }
        }
        Ok(())
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.tunnels.grace_period_ms)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.tunnels.shutdown_grace_ms)
    }

    pub const fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation.interval_secs)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.rotation.tick_ms)
    }

    pub const fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery.interval_ms)
    }

    pub const fn certificate_validity(&self) -> Duration {
        Duration::from_secs(self.certificates.validity_days.saturating_mul(24 * 60 * 60))
    }

    pub const fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.certificates.renewal_threshold_hours.saturating_mul(60 * 60))
    }

    pub const fn certificate_issue_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.certificate_issue_ms)
    }

    pub const fn store_write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.store_write_ms)
    }

    pub const fn backend_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.backend_probe_ms)
    }

    /// Resolved state directory (configured, or the platform default).
    pub fn state_dir(&self) -> Result<PathBuf> {
        self.state
            .directory
            .clone()
            .or_else(default_state_dir)
            .ok_or_else(|| Error::Config("cannot determine state directory".into()))
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    platform_config_dir().map(|p| p.join("config.toml"))
}

/// Default state directory: `<platform config dir>/porthop/state`.
pub fn default_state_dir() -> Option<PathBuf> {
    platform_config_dir().map(|p| p.join("state"))
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".porthop"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/porthop"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|p| p.join("porthop"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.tunnels = overlay.tunnels;
    base.rotation = overlay.rotation;
    if overlay.state.directory.is_some() {
        base.state.directory = overlay.state.directory;
    }
    base.state.backup_retention = overlay.state.backup_retention;
    base.certificates = overlay.certificates;
    base.timeouts = overlay.timeouts;
    base.discovery = overlay.discovery;

    // Later files win per key
    for app in overlay.applications {
        base.applications.retain(|a| a.key != app.key);
        base.applications.push(app);
    }
}

fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("PORTHOP_PORT_RANGE") {
        config.rotation.port_range = val.parse()?;
    }
    if let Some(val) = lookup("PORTHOP_ROTATION_INTERVAL")
        && let Ok(n) = val.parse()
    {
        config.rotation.interval_secs = n;
    }
    if let Some(val) = lookup("PORTHOP_GRACE_PERIOD_MS")
        && let Ok(n) = val.parse()
    {
        config.tunnels.grace_period_ms = n;
    }
    if let Some(val) = lookup("PORTHOP_BACKUP_RETENTION")
        && let Ok(n) = val.parse()
    {
        config.state.backup_retention = n;
    }
    if let Some(val) = lookup("PORTHOP_BIND_ADDRESS") {
        config.tunnels.bind_address = val
            .parse()
            .map_err(|e| Error::Config(format!("invalid PORTHOP_BIND_ADDRESS '{val}': {e}")))?;
    }
    if let Some(val) = lookup("PORTHOP_STATE_DIR") {
        config.state.directory = Some(PathBuf::from(val));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.rotation.port_range, PortRange::new(5000, 6000));
        assert_eq!(config.rotation_interval(), Duration::from_secs(10));
        assert_eq!(config.state.backup_retention, 5);
    }

    #[test]
    fn parse_toml_with_partial_sections() {
        let toml = r#"
            [rotation]
            port_range = { start = 7000, end = 7100 }
            interval_secs = 30

            [[applications]]
            key = "web"
            backend = "127.0.0.1:8080"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.rotation.port_range, PortRange::new(7000, 7100));
        assert_eq!(config.rotation.interval_secs, 30);
        // Unspecified fields in a present section fall back to defaults
        assert_eq!(config.rotation.tick_ms, 1_000);
        assert_eq!(config.tunnels, TunnelsConfig::default());
        assert_eq!(config.applications.len(), 1);
        assert_eq!(config.applications[0].backend.port(), 8080);
    }

    #[test]
    fn automatic_discovery_is_opt_in() {
        assert!(!Config::default().discovery.auto);

        let toml = r#"
            [discovery]
            auto = true
            exclude_ports = [22, 5432]
            exclude_processes = ["sshd"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.discovery.auto);
        assert_eq!(config.discovery.exclude_ports, vec![22, 5432]);
        assert_eq!(config.discovery.exclude_processes, vec!["sshd".to_string()]);
        assert_eq!(config.discovery.interval_ms, 1_000);
    }

    #[test]
    fn load_config_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("porthop.toml");
        std::fs::write(
            &path,
            "[state]\nbackup_retention = 9\n\n[certificates]\nrotate_on_migrate = true\n",
        )
        .unwrap();
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.state.backup_retention, 9);
        assert!(config.certificates.rotate_on_migrate);
    }

    #[test]
    fn load_config_file_missing_is_config_error() {
        let err = load_config_file(Path::new("/nonexistent/porthop.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut config = Config::default();
        config.rotation.port_range = PortRange::new(6000, 5000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let mut config = Config::default();
        config.state.backup_retention = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_certificate_validity_is_rejected_not_overflowed() {
        let mut config = Config::default();
        config.certificates.validity_days = u64::MAX;
        config.certificates.renewal_threshold_hours = u64::MAX;
        assert_eq!(config.certificate_validity(), Duration::from_secs(u64::MAX));
        assert_eq!(config.renewal_threshold(), Duration::from_secs(u64::MAX));
        assert!(config.validate().is_err());

        config.certificates.validity_days = MAX_VALIDITY_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_application_keys() {
        let mut config = Config::default();
        let app: ApplicationConfig = "web=127.0.0.1:8080".parse().unwrap();
        config.applications = vec![app.clone(), app];
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_range_parse_and_len() {
        let range: PortRange = "5000-5010".parse().unwrap();
        assert_eq!(range.len(), 11);
        assert!(range.contains(5003));
        assert!(!range.contains(5011));
        assert!("5000".parse::<PortRange>().is_err());
        assert!(PortRange::new(10, 1).is_empty());
    }

    #[test]
    fn application_config_from_cli_form() {
        let app: ApplicationConfig = "api = 127.0.0.1:9000".parse().unwrap();
        assert_eq!(app.key, "api");
        assert_eq!(app.backend, "127.0.0.1:9000".parse().unwrap());
        assert!("=127.0.0.1:9000".parse::<ApplicationConfig>().is_err());
        assert!("api=nowhere".parse::<ApplicationConfig>().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PORTHOP_PORT_RANGE", "9000-9100"),
            ("PORTHOP_ROTATION_INTERVAL", "60"),
            ("PORTHOP_STATE_DIR", "/tmp/porthop-state"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.rotation.port_range, PortRange::new(9000, 9100));
        assert_eq!(config.rotation.interval_secs, 60);
        assert_eq!(
            config.state.directory,
            Some(PathBuf::from("/tmp/porthop-state"))
        );
    }

    #[test]
    fn env_override_with_bad_range_is_error() {
        let mut config = Config::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "PORTHOP_PORT_RANGE").then(|| "oops".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn merge_replaces_applications_by_key() {
        let mut base = Config::default();
        base.applications
            .push("web=127.0.0.1:8080".parse().unwrap());
        let mut overlay = Config::default();
        overlay
            .applications
            .push("web=127.0.0.1:9090".parse().unwrap());
        overlay
            .applications
            .push("db=127.0.0.1:5432".parse().unwrap());
        merge_config(&mut base, overlay);
        assert_eq!(base.applications.len(), 2);
        let web = base.applications.iter().find(|a| a.key == "web").unwrap();
        assert_eq!(web.backend.port(), 9090);
    }
}
