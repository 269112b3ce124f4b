//! Tunnel lifecycle: open, migrate, close, recover, shutdown.
//!
//! Each tunnel's published record lives in a `watch` channel so readers
//! never wait on the per-tunnel mutex that serializes migrate and close.
//! Every state transition queues exactly one snapshot with the
//! [`StateWriter`]; nothing here waits for the disk.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use porthop_crypto::{
    CertificateAuthority, CertificateMaterial, CertificateMetadata, SecretHandle,
    SecureMemoryStore, unix_now,
};

use super::config::ManagerSettings;
use super::listener::TlsListener;
use super::tls;
use super::types::{Application, TunnelRecord, TunnelState};
use crate::error::{Error, Result};
use crate::rotation::PortPool;
use crate::state::{SecureStateStore, StateSnapshot, StateWriter};

/// Listener binds tried before giving up on a fresh port.
const BIND_ATTEMPTS: usize = 3;

/// Certificate currently served by a tunnel. The private key lives only
/// in secure memory under `key`; the TLS config is built from that copy.
struct ActiveCertificate {
    metadata: CertificateMetadata,
    certificate_der: Vec<u8>,
    key: SecretHandle,
    tls: Arc<ServerConfig>,
}

#[derive(Default)]
struct TunnelInner {
    listener: Option<TlsListener>,
    certificate: Option<ActiveCertificate>,
}

struct Tunnel {
    record: watch::Sender<TunnelRecord>,
    certificate: watch::Sender<Option<CertificateMetadata>>,
    inner: Mutex<TunnelInner>,
}

impl Tunnel {
    fn new(record: TunnelRecord) -> Self {
        Self {
            record: watch::Sender::new(record),
            certificate: watch::Sender::new(None),
            inner: Mutex::new(TunnelInner::default()),
        }
    }

    fn record(&self) -> TunnelRecord {
        self.record.borrow().clone()
    }
}

/// What a restart knows about a tunnel it is bringing back.
#[derive(Default)]
struct Restore {
    material: Option<CertificateMaterial>,
    preferred_port: Option<u16>,
    previous: Option<TunnelRecord>,
}

/// Outcome of [`TunnelManager::recover`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub reopened: Vec<TunnelRecord>,
    pub failed: Vec<(String, Error)>,
}

/// Owns every live tunnel.
pub struct TunnelManager {
    settings: ManagerSettings,
    authority: CertificateAuthority,
    memory: Arc<SecureMemoryStore>,
    ports: Arc<PortPool>,
    writer: StateWriter,
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    sequence: Mutex<u64>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("settings", &self.settings)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    pub fn new(
        settings: ManagerSettings,
        ports: Arc<PortPool>,
        memory: Arc<SecureMemoryStore>,
        writer: StateWriter,
    ) -> Self {
        Self {
            authority: CertificateAuthority::new(settings.certificate_validity),
            settings,
            memory,
            ports,
            writer,
            tunnels: RwLock::new(HashMap::new()),
            sequence: Mutex::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub const fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    // ---- readers -------------------------------------------------------

    /// All live records, ordered by application key.
    pub async fn records(&self) -> Vec<TunnelRecord> {
        let mut records: Vec<_> = self
            .tunnels
            .read()
            .await
            .values()
            .map(|t| t.record())
            .collect();
        records.sort_by(|a, b| a.application_key.cmp(&b.application_key));
        records
    }

    pub async fn record(&self, application_key: &str) -> Option<TunnelRecord> {
        self.tunnels
            .read()
            .await
            .get(application_key)
            .map(|t| t.record())
    }

    pub async fn certificate(&self, application_key: &str) -> Option<CertificateMetadata> {
        self.tunnels
            .read()
            .await
            .get(application_key)
            .and_then(|t| t.certificate.borrow().clone())
    }

    /// Follow a tunnel's record as it changes.
    pub async fn subscribe(&self, application_key: &str) -> Option<watch::Receiver<TunnelRecord>> {
        self.tunnels
            .read()
            .await
            .get(application_key)
            .map(|t| t.record.subscribe())
    }

    /// The snapshot that would be persisted right now.
    pub async fn snapshot(&self) -> StateSnapshot {
        let sequence = *self.sequence.lock().await;
        self.build_snapshot(sequence).await
    }

    async fn build_snapshot(&self, sequence: u64) -> StateSnapshot {
        let tunnels = self.tunnels.read().await;
        let mut records = Vec::with_capacity(tunnels.len());
        let mut certificates = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels.values() {
            records.push(tunnel.record());
            if let Some(metadata) = tunnel.certificate.borrow().clone() {
                certificates.push(metadata);
            }
        }
        drop(tunnels);
        records.sort_by(|a, b| a.application_key.cmp(&b.application_key));
        certificates.sort_by(|a, b| a.identity.cmp(&b.identity));
        StateSnapshot::new(sequence, unix_now(), records, certificates)
    }

    /// Queue the current state with the writer under the next sequence
    /// number. Sequence assignment and submission happen under one lock so
    /// the writer sees snapshots in sequence order.
    async fn publish(&self) -> u64 {
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;
        let snapshot = self.build_snapshot(*sequence).await;
        self.writer.submit(snapshot);
        *sequence
    }

    async fn get(&self, application_key: &str) -> Result<Arc<Tunnel>> {
        self.tunnels
            .read()
            .await
            .get(application_key)
            .cloned()
            .ok_or_else(|| Error::UnknownTunnel(application_key.to_string()))
    }

    // ---- open ----------------------------------------------------------

    /// Open a tunnel for `application` on a fresh port with a fresh
    /// certificate.
    pub async fn open(&self, application: Application) -> Result<TunnelRecord> {
        self.open_with(application, Restore::default()).await
    }

    async fn open_with(&self, application: Application, restore: Restore) -> Result<TunnelRecord> {
        let key = application.application_key.clone();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::InvalidState {
                application_key: key,
                state: "manager shutting down".into(),
            });
        }

        let tunnel = Arc::new(Tunnel::new(TunnelRecord::pending(&application, unix_now())));
        // Nobody can reach the tunnel before it is in the map, so this lock
        // is uncontended and held until the tunnel is Active or gone.
        let mut inner = tunnel.inner.lock().await;
        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.contains_key(&key) {
                return Err(Error::TunnelExists(key));
            }
            tunnels.insert(key.clone(), Arc::clone(&tunnel));
        }
        debug!(application_key = %key, backend = %application.backend_address, "Opening tunnel");

        match self.establish(&application, restore, &mut inner).await {
            Ok(record) => {
                let metadata = inner.certificate.as_ref().map(|c| c.metadata.clone());
                tunnel.certificate.send_replace(metadata);
                tunnel.record.send_replace(record.clone());
                drop(inner);
                self.publish().await;
                info!(
                    application_key = %key,
                    port = record.public_port,
                    backend = %record.backend_address,
                    fingerprint = %record.certificate_fingerprint,
                    "Tunnel open"
                );
                Ok(record)
            }
            Err(e) => {
                tunnel.record.send_modify(|r| r.state = TunnelState::Closed);
                drop(inner);
                self.tunnels.write().await.remove(&key);
                warn!(application_key = %key, error = %e, "Failed to open tunnel");
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        application: &Application,
        restore: Restore,
        inner: &mut TunnelInner,
    ) -> Result<TunnelRecord> {
        let key = application.application_key.as_str();
        self.probe_backend(application.backend_address).await?;

        let restored_certificate = restore.material.is_some();
        let material = match restore.material {
            Some(material) => material,
            None => self.issue_certificate(key, None).await?,
        };
        let active = self.activate(material)?;

        let listener = match self
            .bind_listener(
                key,
                application.backend_address,
                Arc::clone(&active.tls),
                restore.preferred_port,
            )
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.memory.wipe(active.key);
                return Err(match e {
                    Error::PortExhausted { .. } | Error::Io(_) => {
                        Error::PortUnavailable(e.to_string())
                    }
                    other => other,
                });
            }
        };

        if !restored_certificate {
            self.persist_certificate(&active);
        }

        let now = unix_now();
        let port = listener.port();
        let mut record = restore
            .previous
            .unwrap_or_else(|| TunnelRecord::pending(application, now));
        if record.public_port != port {
            record.last_rotated_at = now;
        }
        record.backend_address = application.backend_address;
        record.pid = application.pid;
        record.public_port = port;
        record.previous_port = None;
        record.state = TunnelState::Active;
        record.certificate_fingerprint.clone_from(&active.metadata.fingerprint);

        inner.listener = Some(listener);
        inner.certificate = Some(active);
        Ok(record)
    }

    async fn probe_backend(&self, backend: SocketAddr) -> Result<()> {
        let unreachable = |reason: String| Error::BackendUnreachable {
            address: backend.to_string(),
            reason,
        };
        match tokio::time::timeout(
            self.settings.backend_probe_timeout,
            TcpStream::connect(backend),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "no answer within {}ms",
                self.settings.backend_probe_timeout.as_millis()
            ))),
        }
    }

    /// Issue (or, given `previous`, rotate) a certificate on the blocking
    /// pool under the issuance timeout.
    async fn issue_certificate(
        &self,
        identity: &str,
        previous: Option<CertificateMetadata>,
    ) -> Result<CertificateMaterial> {
        let authority = self.authority.clone();
        let identity = identity.to_string();
        let task = tokio::task::spawn_blocking(move || match previous {
            Some(old) => authority.rotate(&old),
            None => authority.issue(&identity),
        });
        match tokio::time::timeout(self.settings.certificate_issue_timeout, task).await {
            Ok(Ok(Ok(material))) => Ok(material),
            Ok(Ok(Err(e))) => Err(Error::CertGenerationFailed(e.to_string())),
            Ok(Err(join)) => Err(Error::CertGenerationFailed(join.to_string())),
            Err(_) => Err(Error::CertGenerationFailed(format!(
                "issuance timed out after {}ms",
                self.settings.certificate_issue_timeout.as_millis()
            ))),
        }
    }

    /// Move the private key into secure memory, dropping the heap copy, and
    /// build the TLS config from the secured key.
    fn activate(&self, material: CertificateMaterial) -> Result<ActiveCertificate> {
        let CertificateMaterial {
            metadata,
            certificate_der,
            private_key_der,
        } = material;
        let key = self.memory.store(&private_key_der)?;
        drop(private_key_der);
        match self.tls_config(&certificate_der, key) {
            Ok(tls) => Ok(ActiveCertificate {
                metadata,
                certificate_der,
                key,
                tls,
            }),
            Err(e) => {
                self.memory.wipe(key);
                Err(e)
            }
        }
    }

    /// Server config for `certificate_der` with the key held under `key`.
    fn tls_config(&self, certificate_der: &[u8], key: SecretHandle) -> Result<Arc<ServerConfig>> {
        let private_key = self.memory.read(key)?;
        tls::server_config(certificate_der, &private_key)
            .map_err(|e| Error::CertGenerationFailed(format!("TLS config: {e}")))
    }

    /// Queue the encrypted blob for a certificate whose key is in secure
    /// memory. A failure leaves the tunnel serving; recovery reissues.
    fn persist_certificate(&self, active: &ActiveCertificate) {
        let material = self.memory.read(active.key).and_then(|key| {
            CertificateMaterial::from_parts(
                active.metadata.clone(),
                active.certificate_der.clone(),
                key,
            )
        });
        match material {
            Ok(material) => self.writer.store_certificate(material),
            Err(e) => warn!(
                fingerprint = %active.metadata.fingerprint,
                error = %e,
                "Certificate blob not persisted"
            ),
        }
    }

    /// Wipe a certificate's key and delete its blob.
    fn retire(&self, certificate: ActiveCertificate) {
        self.memory.wipe(certificate.key);
        self.writer
            .remove_certificate(certificate.metadata.fingerprint.clone());
        debug!(fingerprint = %certificate.metadata.fingerprint, "Certificate retired");
    }

    /// Reserve a port and bind a listener on it. Allocation failures come
    /// back as [`Error::PortExhausted`], bind failures as [`Error::Io`].
    async fn bind_listener(
        &self,
        application_key: &str,
        backend: SocketAddr,
        tls: Arc<ServerConfig>,
        preferred_port: Option<u16>,
    ) -> Result<TlsListener> {
        let mut last_error = None;
        for attempt in 0..BIND_ATTEMPTS {
            let port = match preferred_port.filter(|p| attempt == 0 && self.ports.reserve(*p)) {
                Some(port) => port,
                None => self.ports.allocate()?,
            };
            match TlsListener::bind(
                application_key,
                self.settings.bind_address,
                port,
                backend,
                Arc::clone(&tls),
            )
            .await
            {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    self.ports.release(port);
                    warn!(application_key, port, error = %e, "Bind failed");
                    last_error = Some(e);
                }
            }
        }
        Err(Error::Io(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port could be bound")
        })))
    }

    // ---- migrate -------------------------------------------------------

    /// Move an `Active` tunnel to a new port, make-before-break.
    ///
    /// Until the new listener is bound (and, if configured, has answered a
    /// pinned TLS probe) the old listener stays authoritative and any error
    /// leaves the tunnel untouched.
    pub async fn migrate(&self, application_key: &str) -> Result<TunnelRecord> {
        let tunnel = self.get(application_key).await?;
        let mut inner = tunnel.inner.lock().await;

        let record = tunnel.record();
        let Some((current_metadata, current_tls)) = inner
            .certificate
            .as_ref()
            .map(|c| (c.metadata.clone(), Arc::clone(&c.tls)))
            .filter(|_| record.state == TunnelState::Active && inner.listener.is_some())
        else {
            return Err(Error::InvalidState {
                application_key: application_key.to_string(),
                state: record.state.to_string(),
            });
        };

        let now = unix_now();
        let renew = self.settings.rotate_on_migrate
            || current_metadata.expires_within(now, self.settings.renewal_threshold);
        let (replacement, tls, fingerprint) = if renew {
            let material = self
                .issue_certificate(application_key, Some(current_metadata.clone()))
                .await?;
            let active = self.activate(material)?;
            let tls = Arc::clone(&active.tls);
            let fingerprint = active.metadata.fingerprint.clone();
            (Some(active), tls, fingerprint)
        } else {
            (None, current_tls, current_metadata.fingerprint.clone())
        };
        let discard = |replacement: Option<ActiveCertificate>| {
            if let Some(active) = replacement {
                self.memory.wipe(active.key);
            }
        };

        let listener = match self
            .bind_listener(application_key, record.backend_address, tls, None)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                discard(replacement);
                return Err(match e {
                    Error::Io(io) => Error::MigrationFailed {
                        application_key: application_key.to_string(),
                        reason: format!("bind: {io}"),
                    },
                    other => other,
                });
            }
        };
        let new_port = listener.port();

        if self.settings.verify_new_listener {
            let addr = SocketAddr::new(self.settings.probe_address(), new_port);
            if let Err(e) = tls::probe(addr, &fingerprint, self.settings.backend_probe_timeout).await
            {
                listener.drain(Duration::ZERO).await;
                self.ports.release(new_port);
                discard(replacement);
                return Err(Error::MigrationFailed {
                    application_key: application_key.to_string(),
                    reason: format!("self-probe on port {new_port}: {e}"),
                });
            }
        }

        // Switch: the new listener is live, the old one stops accepting.
        let old_port = record.public_port;
        let new_certificate = replacement.map(|active| {
            self.persist_certificate(&active);
            tunnel.certificate.send_replace(Some(active.metadata.clone()));
            active
        });
        tunnel.record.send_modify(|r| {
            r.state = TunnelState::Rotating;
            r.previous_port = Some(old_port);
            r.public_port = new_port;
            r.certificate_fingerprint.clone_from(&fingerprint);
        });
        self.publish().await;
        info!(
            application_key,
            from = old_port,
            to = new_port,
            renewed = new_certificate.is_some(),
            "Switched tunnel to new port"
        );

        if let Some(old) = inner.listener.replace(listener) {
            let report = old.drain(self.settings.grace_period).await;
            debug!(
                application_key,
                port = old_port,
                in_flight = report.in_flight,
                forced = report.forced,
                "Old listener drained"
            );
        }
        self.ports.release(old_port);

        if let Some(active) = new_certificate
            && let Some(old) = inner.certificate.replace(active)
        {
            self.retire(old);
        }

        let finished = unix_now();
        tunnel.record.send_modify(|r| {
            r.state = TunnelState::Active;
            r.previous_port = None;
            r.last_rotated_at = finished;
            r.rotation_count += 1;
        });
        let record = tunnel.record();
        drop(inner);
        self.publish().await;
        Ok(record)
    }

    // ---- close ---------------------------------------------------------

    /// Drain and remove a tunnel.
    pub async fn close(&self, application_key: &str) -> Result<TunnelRecord> {
        self.close_with_grace(application_key, self.settings.grace_period)
            .await
    }

    async fn close_with_grace(&self, application_key: &str, grace: Duration) -> Result<TunnelRecord> {
        let tunnel = self.get(application_key).await?;
        let mut inner = tunnel.inner.lock().await;

        match tunnel.record.borrow().state {
            TunnelState::Active | TunnelState::Rotating => {}
            TunnelState::Closed => return Err(Error::UnknownTunnel(application_key.to_string())),
            state @ (TunnelState::Pending | TunnelState::Draining) => {
                return Err(Error::InvalidState {
                    application_key: application_key.to_string(),
                    state: state.to_string(),
                });
            }
        }

        tunnel.record.send_modify(|r| r.state = TunnelState::Draining);
        self.publish().await;

        if let Some(listener) = inner.listener.take() {
            let port = listener.port();
            let report = listener.drain(grace).await;
            self.ports.release(port);
            debug!(application_key, port, forced = report.forced, "Listener drained");
        }
        if let Some(certificate) = inner.certificate.take() {
            self.retire(certificate);
        }

        tunnel.certificate.send_replace(None);
        tunnel.record.send_modify(|r| {
            r.state = TunnelState::Closed;
            r.previous_port = None;
        });
        let record = tunnel.record();
        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels
                .get(application_key)
                .is_some_and(|t| Arc::ptr_eq(t, &tunnel))
            {
                tunnels.remove(application_key);
            }
        }
        drop(inner);
        self.publish().await;
        info!(application_key, "Tunnel closed");
        Ok(record)
    }

    // ---- recover / shutdown ---------------------------------------------

    /// Re-open the tunnels that were live in `snapshot`, reusing their
    /// certificates when the blob is intact and not close to expiry.
    pub async fn recover(
        &self,
        snapshot: &StateSnapshot,
        store: &Arc<SecureStateStore>,
    ) -> RecoveryReport {
        {
            let mut sequence = self.sequence.lock().await;
            *sequence = (*sequence).max(snapshot.sequence);
        }

        let mut report = RecoveryReport::default();
        for previous in &snapshot.tunnels {
            let key = previous.application_key.clone();
            let old_fingerprint = previous.certificate_fingerprint.clone();

            // A tunnel caught mid-close stays closed.
            if matches!(
                previous.state,
                TunnelState::Draining | TunnelState::Closed | TunnelState::Pending
            ) {
                debug!(application_key = %key, state = %previous.state, "Not recovering tunnel");
                if !old_fingerprint.is_empty() {
                    self.writer.remove_certificate(old_fingerprint);
                }
                continue;
            }

            let material = self.reusable_certificate(store, previous).await;
            let restore = Restore {
                material,
                preferred_port: Some(previous.public_port),
                previous: Some(previous.clone()),
            };
            let result = self.open_with(previous.application(), restore).await;

            let reused = matches!(&result, Ok(r) if r.certificate_fingerprint == old_fingerprint);
            if !reused && !old_fingerprint.is_empty() {
                self.writer.remove_certificate(old_fingerprint);
            }
            match result {
                Ok(record) => report.reopened.push(record),
                Err(e) => {
                    warn!(application_key = %key, error = %e, "Could not recover tunnel");
                    report.failed.push((key, e));
                }
            }
        }

        info!(
            reopened = report.reopened.len(),
            failed = report.failed.len(),
            "Recovery complete"
        );
        report
    }

    async fn reusable_certificate(
        &self,
        store: &Arc<SecureStateStore>,
        record: &TunnelRecord,
    ) -> Option<CertificateMaterial> {
        if record.certificate_fingerprint.is_empty() {
            return None;
        }
        let fingerprint = record.certificate_fingerprint.clone();
        let store = Arc::clone(store);
        let loaded = tokio::task::spawn_blocking(move || store.load_certificate(&fingerprint)).await;
        match loaded {
            Ok(Ok(material))
                if !material
                    .metadata
                    .expires_within(unix_now(), self.settings.renewal_threshold) =>
            {
                Some(material)
            }
            Ok(Ok(_)) => {
                debug!(application_key = %record.application_key, "Stored certificate near expiry, reissuing");
                None
            }
            Ok(Err(e)) => {
                warn!(application_key = %record.application_key, error = %e, "Stored certificate unusable, reissuing");
                None
            }
            Err(e) => {
                warn!(application_key = %record.application_key, error = %e, "Certificate load task failed");
                None
            }
        }
    }

    /// Close every tunnel within `grace`, flush a final snapshot and wipe
    /// all secrets. No tunnel can be opened afterwards.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::Release);
        let keys: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        info!(tunnels = keys.len(), grace_ms = grace.as_millis(), "Shutting down tunnels");

        let mut closing = JoinSet::new();
        for key in keys {
            let manager = Arc::clone(self);
            closing.spawn(async move {
                let result = manager.close_with_grace(&key, grace).await;
                (key, result)
            });
        }
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((key, Err(e))) => warn!(application_key = %key, error = %e, "Close during shutdown failed"),
                Err(e) => warn!(error = %e, "Close task failed"),
            }
        }

        let sequence = self.publish().await;
        let flushed = self.writer.flush().await;
        if let Err(e) = &flushed {
            warn!(error = %e, "Final snapshot not persisted");
        }
        let wiped = self.memory.wipe_all();
        info!(sequence, wiped, "Tunnel manager stopped");
        flushed
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
