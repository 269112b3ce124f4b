//! Periodic and on-demand port rotation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use porthop_core::Config;
use porthop_crypto::unix_now;

use crate::error::{Error, Result};
use crate::tunnel::{TunnelManager, TunnelRecord};

/// Outcome of one scheduler pass.
#[derive(Debug, Default)]
pub struct TickReport {
    pub rotated: Vec<TunnelRecord>,
    pub failed: Vec<(String, Error)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.rotated.is_empty() && self.failed.is_empty()
    }
}

/// Drives [`TunnelManager::migrate`] for tunnels whose port has been in
/// use for at least the rotation interval.
#[derive(Debug)]
pub struct PortRotationScheduler {
    manager: Arc<TunnelManager>,
    interval: Duration,
    tick_every: Duration,
    auto_rotation: AtomicBool,
}

impl PortRotationScheduler {
    pub const fn new(
        manager: Arc<TunnelManager>,
        interval: Duration,
        tick_every: Duration,
        auto_rotation: bool,
    ) -> Self {
        Self {
            manager,
            interval,
            tick_every,
            auto_rotation: AtomicBool::new(auto_rotation),
        }
    }

    pub const fn from_config(manager: Arc<TunnelManager>, config: &Config) -> Self {
        Self::new(
            manager,
            config.rotation_interval(),
            config.tick_interval(),
            config.rotation.auto_rotation,
        )
    }

    pub const fn manager(&self) -> &Arc<TunnelManager> {
        &self.manager
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn auto_rotation_enabled(&self) -> bool {
        self.auto_rotation.load(Ordering::Acquire)
    }

    /// Flip periodic rotation on or off. Returns the new setting.
    pub fn toggle_auto_rotation(&self) -> bool {
        let enabled = !self.auto_rotation.fetch_xor(true, Ordering::AcqRel);
        info!(enabled, "Auto rotation toggled");
        enabled
    }

    /// Rotate one tunnel now, regardless of its age.
    pub async fn force_rotate(&self, application_key: &str) -> Result<TunnelRecord> {
        info!(application_key, "Forced rotation requested");
        self.manager.migrate(application_key).await
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(unix_now()).await
    }

    /// Migrate every `Active` tunnel that is due at `now`. Due tunnels are
    /// rotated concurrently; one failing tunnel does not affect the others.
    pub async fn tick_at(&self, now: i64) -> TickReport {
        let interval_secs = self.interval.as_secs();
        let due: Vec<String> = self
            .manager
            .records()
            .await
            .into_iter()
            .filter(|r| r.is_due(now, interval_secs))
            .map(|r| r.application_key)
            .collect();

        let mut report = TickReport::default();
        if due.is_empty() {
            return report;
        }
        debug!(due = due.len(), "Rotation tick");

        let mut migrations = JoinSet::new();
        for key in due {
            let manager = Arc::clone(&self.manager);
            migrations.spawn(async move {
                let result = manager.migrate(&key).await;
                (key, result)
            });
        }
        while let Some(joined) = migrations.join_next().await {
            match joined {
                Ok((_, Ok(record))) => report.rotated.push(record),
                Ok((key, Err(e))) => {
                    warn!(application_key = %key, error = %e, retryable = e.is_retryable(), "Rotation failed");
                    report.failed.push((key, e));
                }
                Err(e) => warn!(error = %e, "Rotation task panicked"),
            }
        }
        report
    }

    /// Run the periodic loop until `shutdown` flips to `true`. A tick in
    /// progress finishes; no new tick starts after shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = self.interval.as_secs(),
                tick_ms = self.tick_every.as_millis(),
                "Rotation scheduler started"
            );
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
                if !self.auto_rotation_enabled() {
                    continue;
                }
                let report = self.tick().await;
                if !report.is_empty() {
                    info!(
                        rotated = report.rotated.len(),
                        failed = report.failed.len(),
                        "Rotation pass complete"
                    );
                }
            }
            info!("Rotation scheduler stopped");
        })
    }
}
