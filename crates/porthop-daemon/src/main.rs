//! `PortHop` Daemon
//!
//! Fronts local applications with TLS tunnels, moves each tunnel's public
//! port on a schedule and keeps the tunnel set in encrypted state so a
//! restart brings every tunnel back.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{error, info, warn};

use porthop_core::Config;
use porthop_core::config::{ApplicationConfig, PortRange, load_config};
use porthop_core::tracing_init::{default_filter, init_tracing};
use porthop_crypto::{PlatformLocker, SecureMemoryStore};
use porthop_daemon::analysis::HeuristicAnalyzer;
use porthop_daemon::control::{ControlExit, Controller};
use porthop_daemon::discovery::{
    Discovery, LayeredDiscovery, ProcNetDiscovery, ProcNetFilter, StaticDiscovery,
    spawn_discovery_loop,
};
use porthop_daemon::rotation::{PortPool, PortRotationScheduler};
use porthop_daemon::state::{SecureStateStore, StateWriter, WriterSettings};
use porthop_daemon::tunnel::{ManagerSettings, RetryPolicy, TunnelManager};

#[derive(Parser, Debug)]
#[command(name = "porthop-daemon")]
#[command(version, about = "PortHop daemon - TLS tunnels with rotating public ports")]
struct Args {
    /// Configuration file (merged over the global config)
    #[arg(long, short, env = "PORTHOP_CONFIG")]
    config: Option<PathBuf>,

    /// Application to tunnel, as KEY=HOST:PORT (repeatable)
    #[arg(long = "app", value_name = "KEY=HOST:PORT")]
    apps: Vec<ApplicationConfig>,

    /// Public port range, e.g. 5000-6000
    #[arg(long)]
    port_range: Option<PortRange>,

    /// Address public listeners bind to
    #[arg(long)]
    bind_address: Option<IpAddr>,

    /// Seconds between rotations of each tunnel
    #[arg(long)]
    rotation_interval: Option<u64>,

    /// Milliseconds a retired port keeps serving in-flight connections
    #[arg(long)]
    grace_period_ms: Option<u64>,

    /// State directory (encrypted snapshots, backups, certificate blobs)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Start with periodic rotation disabled
    #[arg(long)]
    no_auto_rotation: bool,

    /// Replace the certificate on every rotation
    #[arg(long)]
    rotate_certificates: bool,

    /// Also tunnel every local TCP listener found in /proc/net
    #[arg(long)]
    auto_discover: bool,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_control: bool,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PORTHOP_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PORTHOP_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Command-line flags win over every other configuration source.
    fn apply(&self, config: &mut Config) {
        if let Some(range) = self.port_range {
            config.rotation.port_range = range;
        }
        if let Some(address) = self.bind_address {
            config.tunnels.bind_address = address;
        }
        if let Some(secs) = self.rotation_interval {
            config.rotation.interval_secs = secs;
        }
        if let Some(ms) = self.grace_period_ms {
            config.tunnels.grace_period_ms = ms;
        }
        if let Some(dir) = &self.state_dir {
            config.state.directory = Some(dir.clone());
        }
        if self.no_auto_rotation {
            config.rotation.auto_rotation = false;
        }
        if self.rotate_certificates {
            config.certificates.rotate_on_migrate = true;
        }
        if self.auto_discover {
            config.discovery.auto = true;
        }
        for app in &self.apps {
            config.applications.retain(|a| a.key != app.key);
            config.applications.push(app.clone());
        }
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &default_filter("porthop_daemon", &args.log_level),
        args.log_json,
    );

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    let state_dir = config.state_dir()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.tunnels.bind_address,
        port_range = %config.rotation.port_range,
        interval_secs = config.rotation.interval_secs,
        applications = config.applications.len(),
        auto_discovery = config.discovery.auto,
        state_dir = %state_dir.display(),
        "Starting porthop-daemon"
    );

    let memory = Arc::new(SecureMemoryStore::new(Box::new(PlatformLocker)));
    let store = Arc::new(SecureStateStore::open(
        &state_dir,
        config.state.backup_retention,
        Arc::clone(&memory),
    )?);
    let snapshot = match store.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Persisted state cannot be verified, refusing to start");
            memory.wipe_all();
            return Err(e.into());
        }
    };

    let (writer, writer_task) = StateWriter::spawn(
        Arc::clone(&store),
        WriterSettings {
            write_timeout: config.store_write_timeout(),
            retry: RetryPolicy::default(),
        },
    );
    let ports = Arc::new(PortPool::bind_probed(
        config.rotation.port_range,
        config.tunnels.bind_address,
        config.rotation.max_port_attempts,
    ));
    let manager = Arc::new(TunnelManager::new(
        ManagerSettings::from_config(&config),
        ports,
        Arc::clone(&memory),
        writer,
    ));

    let recovery = manager.recover(&snapshot, &store).await;
    if !recovery.failed.is_empty() {
        warn!(
            failed = recovery.failed.len(),
            "Some tunnels could not be recovered; discovery will retry configured ones"
        );
    }

    let shutdown = watch::Sender::new(false);
    let mut discovery =
        LayeredDiscovery::new().with(Arc::new(StaticDiscovery::from_config(&config.applications)));
    if config.discovery.auto {
        info!(
            exclude_ports = ?config.discovery.exclude_ports,
            exclude_processes = ?config.discovery.exclude_processes,
            "Automatic discovery of local listeners enabled"
        );
        discovery = discovery.with(Arc::new(ProcNetDiscovery::new(ProcNetFilter::from_config(
            &config.discovery,
            config.rotation.port_range,
        ))));
    }
    let discovery: Arc<dyn Discovery> = Arc::new(discovery);
    let discovery_task = spawn_discovery_loop(
        Arc::clone(&manager),
        discovery,
        config.discovery_interval(),
        shutdown.subscribe(),
    );
    let scheduler = Arc::new(PortRotationScheduler::from_config(
        Arc::clone(&manager),
        &config,
    ));
    let scheduler_task = Arc::clone(&scheduler).spawn(shutdown.subscribe());
    let controller = Controller::new(Arc::clone(&scheduler), Box::new(HeuristicAnalyzer::default()));

    let control = async {
        if args.no_control {
            return std::future::pending().await;
        }
        match controller
            .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
        {
            Ok(ControlExit::Quit) => {}
            Ok(ControlExit::EndOfInput) => {
                info!("Control input closed, running until signalled");
                std::future::pending::<()>().await;
            }
            Err(e) => {
                warn!(error = %e, "Control input failed, running until signalled");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "sd_notify READY failed");
    }
    info!(tunnels = recovery.reopened.len(), "porthop-daemon ready");

    tokio::select! {
        () = control => {
            info!("Quit requested from control input");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);

    // Stop ticking before tunnels start closing.
    let _ = shutdown.send(true);
    let _ = scheduler_task.await;
    let _ = discovery_task.await;

    if let Err(e) = manager.shutdown(config.shutdown_grace()).await {
        warn!(error = %e, "Final state flush failed");
    }

    // The writer task exits once the last handle (inside the manager) is gone.
    drop(controller);
    drop(scheduler);
    drop(manager);
    if tokio::time::timeout(Duration::from_secs(5), writer_task)
        .await
        .is_err()
    {
        warn!("State writer did not stop in time");
    }

    info!("Daemon stopped");
    Ok(())
}
