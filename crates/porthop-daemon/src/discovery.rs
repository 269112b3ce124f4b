//! Application discovery and reconciliation with the live tunnel set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use porthop_core::config::ApplicationConfig;

use crate::error::{Error, Result};
use crate::tunnel::{Application, TunnelManager};

mod proc_net;

pub use proc_net::{ListeningSocket, ProcNetDiscovery, ProcNetFilter, parse_listeners};

/// Source of applications that should be tunneled.
pub trait Discovery: Send + Sync {
    fn discover(&self) -> Result<Vec<Application>>;
}

/// A fixed list of applications from configuration or the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    applications: Vec<Application>,
}

impl StaticDiscovery {
    pub const fn new(applications: Vec<Application>) -> Self {
        Self { applications }
    }

    pub fn from_config(applications: &[ApplicationConfig]) -> Self {
        Self::new(applications.iter().map(Application::from).collect())
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<Application>> {
        Ok(self.applications.clone())
    }
}

/// Several discovery sources merged in order.
///
/// An application from a later source is dropped when an earlier one already
/// uses its key or backend address, so configured applications take
/// precedence over automatically found listeners.
#[derive(Default)]
pub struct LayeredDiscovery {
    layers: Vec<Arc<dyn Discovery>>,
}

impl LayeredDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, layer: Arc<dyn Discovery>) -> Self {
        self.layers.push(layer);
        self
    }
}

impl std::fmt::Debug for LayeredDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredDiscovery")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Discovery for LayeredDiscovery {
    fn discover(&self) -> Result<Vec<Application>> {
        let mut keys = HashSet::new();
        let mut backends = HashSet::new();
        let mut merged = Vec::new();
        for layer in &self.layers {
            for application in layer.discover()? {
                if keys.contains(&application.application_key)
                    || backends.contains(&application.backend_address)
                {
                    continue;
                }
                keys.insert(application.application_key.clone());
                backends.insert(application.backend_address);
                merged.push(application);
            }
        }
        Ok(merged)
    }
}

/// What [`reconcile`] changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }
}

/// Bring the manager's tunnel set in line with `discovered`.
///
/// Applications without a tunnel are opened, tunnels whose application
/// disappeared are closed, and a tunnel whose backend address changed is
/// closed and opened again. Later duplicates of a key are ignored.
pub async fn reconcile(manager: &TunnelManager, discovered: Vec<Application>) -> ReconcileReport {
    let mut wanted: HashMap<String, Application> = HashMap::with_capacity(discovered.len());
    for application in discovered {
        if wanted.contains_key(&application.application_key) {
            warn!(application_key = %application.application_key, "Duplicate application key ignored");
            continue;
        }
        wanted.insert(application.application_key.clone(), application);
    }

    let mut report = ReconcileReport::default();
    for record in manager.records().await {
        let key = record.application_key;
        let keep = wanted
            .get(&key)
            .is_some_and(|app| app.backend_address == record.backend_address);
        if keep {
            wanted.remove(&key);
            continue;
        }
        match manager.close(&key).await {
            Ok(_) => report.closed.push(key),
            // Already gone, e.g. closed concurrently.
            Err(Error::UnknownTunnel(_)) => {}
            Err(e) => {
                warn!(application_key = %key, error = %e, "Failed to close tunnel");
                wanted.remove(&key);
                report.failed.push((key, e));
            }
        }
    }

    let mut pending: Vec<Application> = wanted.into_values().collect();
    pending.sort_by(|a, b| a.application_key.cmp(&b.application_key));
    for application in pending {
        let key = application.application_key.clone();
        match manager.open(application).await {
            Ok(_) => report.opened.push(key),
            Err(Error::TunnelExists(_)) => debug!(application_key = %key, "Tunnel already open"),
            Err(e) => report.failed.push((key, e)),
        }
    }
    report
}

/// Periodically discover applications and reconcile until `shutdown`
/// flips to `true`.
pub fn spawn_discovery_loop(
    manager: Arc<TunnelManager>,
    discovery: Arc<dyn Discovery>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            // A procfs scan walks every process; run it on the blocking pool.
            let source = Arc::clone(&discovery);
            let discovered = match tokio::task::spawn_blocking(move || source.discover()).await {
                Ok(Ok(apps)) => apps,
                Ok(Err(e)) => {
                    warn!(error = %e, "Discovery failed");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Discovery task failed");
                    continue;
                }
            };
            let report = reconcile(&manager, discovered).await;
            if !report.is_empty() {
                info!(
                    opened = report.opened.len(),
                    closed = report.closed.len(),
                    failed = report.failed.len(),
                    "Reconciled applications"
                );
            }
            for (key, e) in &report.failed {
                debug!(application_key = %key, error = %e, "Reconcile failure");
            }
        }
        debug!("Discovery loop stopped");
    })
}
