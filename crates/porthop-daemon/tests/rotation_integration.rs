//! End-to-end rotation: real listeners, real TLS, real state directory.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use porthop_core::config::PortRange;
use porthop_crypto::{SecureMemoryStore, unlocked_store};
use porthop_daemon::Error;
use porthop_daemon::discovery::{Discovery, StaticDiscovery, reconcile};
use porthop_daemon::rotation::{PortPool, PortRotationScheduler};
use porthop_daemon::state::{SecureStateStore, StateWriter, WriterSettings};
use porthop_daemon::tunnel::tls::{connect_pinned, probe};
use porthop_daemon::tunnel::{Application, ManagerSettings, TunnelManager, TunnelState};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Daemon {
    manager: Arc<TunnelManager>,
    scheduler: Arc<PortRotationScheduler>,
    store: Arc<SecureStateStore>,
    writer: StateWriter,
    memory: Arc<SecureMemoryStore>,
}

fn start(dir: &Path, range: PortRange, grace: Duration) -> Daemon {
    start_with_pool(dir, PortPool::bind_probed(range, LOCALHOST, 64), grace)
}

fn start_with_pool(dir: &Path, pool: PortPool, grace: Duration) -> Daemon {
    let memory = Arc::new(unlocked_store());
    let store = Arc::new(SecureStateStore::open(dir, 3, Arc::clone(&memory)).unwrap());
    let (writer, _task) = StateWriter::spawn(Arc::clone(&store), WriterSettings::default());
    let ports = Arc::new(pool);
    let settings = ManagerSettings {
        grace_period: grace,
        ..ManagerSettings::default()
    };
    let manager = Arc::new(TunnelManager::new(
        settings,
        ports,
        Arc::clone(&memory),
        writer.clone(),
    ));
    let scheduler = Arc::new(PortRotationScheduler::new(
        Arc::clone(&manager),
        Duration::from_secs(10),
        Duration::from_secs(1),
        true,
    ));
    Daemon {
        manager,
        scheduler,
        store,
        writer,
        memory,
    }
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn at(port: u16) -> SocketAddr {
    SocketAddr::new(LOCALHOST, port)
}

#[tokio::test]
async fn force_rotate_is_make_before_break_and_skips_busy_port() {
    // Hold 5003 for the whole test; if something else already owns it,
    // the pool must skip it all the same.
    let _busy = std::net::TcpListener::bind((LOCALHOST, 5003)).ok();
    let range = PortRange::new(5000, 5010);
    let dir = tempfile::tempdir().unwrap();
    let daemon = start(dir.path(), range, Duration::from_secs(10));

    let opened = daemon
        .manager
        .open(Application::new("web", echo_backend().await))
        .await
        .unwrap();
    let fingerprint = opened.certificate_fingerprint.clone();
    assert_ne!(opened.public_port, 5003);
    probe(at(opened.public_port), &fingerprint, Duration::from_secs(2))
        .await
        .unwrap();

    let mut held = connect_pinned(at(opened.public_port), &fingerprint)
        .await
        .unwrap();
    held.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    held.read_exact(&mut buf).await.unwrap();

    let mut updates = daemon.manager.subscribe("web").await.unwrap();
    let scheduler = Arc::clone(&daemon.scheduler);
    let rotation = tokio::spawn(async move { scheduler.force_rotate("web").await });

    let switching = updates
        .wait_for(|r| r.state == TunnelState::Rotating)
        .await
        .unwrap()
        .clone();
    // Both ports are up: the new one for fresh clients, the old one for
    // the connection that was already there.
    assert_eq!(switching.previous_port, Some(opened.public_port));
    assert_ne!(switching.public_port, 5003);
    probe(at(switching.public_port), &fingerprint, Duration::from_secs(2))
        .await
        .unwrap();
    held.write_all(b"two").await.unwrap();
    held.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    held.shutdown().await.unwrap();
    drop(held);
    let rotated = rotation.await.unwrap().unwrap();
    assert_eq!(rotated.state, TunnelState::Active);
    probe(at(rotated.public_port), &fingerprint, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(probe(at(opened.public_port), &fingerprint, Duration::from_secs(1))
        .await
        .is_err());

    // Keep rotating through the small range; 5003 never comes up.
    for _ in 0..8 {
        let record = daemon.scheduler.force_rotate("web").await.unwrap();
        assert!(range.contains(record.public_port));
        assert_ne!(record.public_port, 5003);
    }
    assert_eq!(daemon.manager.record("web").await.unwrap().rotation_count, 9);
}

#[tokio::test]
async fn fully_occupied_range_is_exhausted() {
    let range = PortRange::new(45_000, 45_003);
    let occupied = |_port: u16| true;

    let pool = PortPool::new(range, Box::new(occupied), 16);
    assert!(matches!(pool.allocate(), Err(Error::PortExhausted { .. })));
    assert_eq!(pool.reserved_count(), 0);

    let dir = tempfile::tempdir().unwrap();
    let daemon = start_with_pool(
        dir.path(),
        PortPool::new(range, Box::new(occupied), 16),
        Duration::from_millis(100),
    );
    let err = daemon
        .manager
        .open(Application::new("web", echo_backend().await))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PortUnavailable(_)));
    assert!(daemon.manager.records().await.is_empty());
}

#[tokio::test]
async fn restart_brings_tunnels_back_with_same_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let range = PortRange::new(45_100, 45_149);
    let apps = vec![
        Application::new("api", echo_backend().await),
        Application::new("web", echo_backend().await),
    ];

    let before = {
        let daemon = start(dir.path(), range, Duration::from_millis(100));
        let discovery = StaticDiscovery::new(apps.clone());
        let report = reconcile(&daemon.manager, discovery.discover().unwrap()).await;
        assert_eq!(report.opened.len(), 2);
        daemon.scheduler.force_rotate("web").await.unwrap();
        daemon.writer.flush().await.unwrap();
        daemon.manager.records().await
    };

    let daemon = start(dir.path(), range, Duration::from_millis(100));
    let snapshot = daemon.store.load().unwrap();
    assert_eq!(snapshot.tunnels, before);

    let report = daemon.manager.recover(&snapshot, &daemon.store).await;
    assert!(report.failed.is_empty());
    let after = daemon.manager.records().await;
    assert_eq!(after.len(), 2);
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(new.application_key, old.application_key);
        assert_eq!(new.certificate_fingerprint, old.certificate_fingerprint);
        assert_eq!(new.rotation_count, old.rotation_count);
        probe(
            at(new.public_port),
            &new.certificate_fingerprint,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    }

    // Discovery sees nothing new to do after recovery.
    let report = reconcile(&daemon.manager, apps).await;
    assert!(report.is_empty());

    daemon.manager.shutdown(Duration::from_millis(100)).await.unwrap();
    assert!(daemon.memory.is_empty());
}
