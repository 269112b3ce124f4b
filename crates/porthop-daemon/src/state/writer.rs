//! Single-writer persistence task.
//!
//! The tunnel manager never waits on disk I/O: it hands requests to a
//! [`StateWriter`] and moves on. One task drains the queue in order, runs
//! each store operation on the blocking pool under a timeout, and retries
//! failures with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use porthop_crypto::CertificateMaterial;

use super::snapshot::StateSnapshot;
use super::store::SecureStateStore;
use crate::error::{Error, Result};
use crate::tunnel::config::RetryPolicy;

/// Work item for the writer task.
#[derive(Debug)]
pub enum WriteRequest {
    Save(StateSnapshot),
    StoreCertificate(Box<CertificateMaterial>),
    RemoveCertificate(String),
    /// Reply once everything queued before it has been processed, with the
    /// last snapshot save's outcome.
    Flush(oneshot::Sender<Result<()>>),
}

/// Timeouts and retry behaviour for the writer task.
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Cloneable handle to the writer task.
#[derive(Debug, Clone)]
pub struct StateWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl StateWriter {
    /// Start the writer task. It runs until every handle is dropped.
    pub fn spawn(store: Arc<SecureStateStore>, settings: WriterSettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(store, rx, settings));
        (Self { tx }, task)
    }

    fn send(&self, request: WriteRequest) {
        if self.tx.send(request).is_err() {
            warn!("State writer is gone, dropping write request");
        }
    }

    /// Queue a snapshot. Never blocks.
    pub fn submit(&self, snapshot: StateSnapshot) {
        self.send(WriteRequest::Save(snapshot));
    }

    pub fn store_certificate(&self, material: CertificateMaterial) {
        self.send(WriteRequest::StoreCertificate(Box::new(material)));
    }

    pub fn remove_certificate(&self, fingerprint: impl Into<String>) {
        self.send(WriteRequest::RemoveCertificate(fingerprint.into()));
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WriteRequest::Flush(reply))
            .map_err(|_| Error::PersistenceFailed("state writer stopped".into()))?;
        done.await
            .map_err(|_| Error::PersistenceFailed("state writer stopped".into()))?
    }
}

async fn run(
    store: Arc<SecureStateStore>,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    settings: WriterSettings,
) {
    debug!("State writer started");
    let mut last_save: Result<()> = Ok(());

    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::Save(snapshot) => {
                let sequence = snapshot.sequence;
                let snapshot = Arc::new(snapshot);
                let result = with_retry(&settings.retry, "save snapshot", || {
                    let store = Arc::clone(&store);
                    let snapshot = Arc::clone(&snapshot);
                    blocking(settings.write_timeout, move || store.save(&snapshot))
                })
                .await;
                if result.is_ok() {
                    debug!(sequence, "Snapshot written");
                }
                last_save = result;
            }
            WriteRequest::StoreCertificate(material) => {
                let fingerprint = material.metadata.fingerprint.clone();
                let material: Arc<CertificateMaterial> = Arc::from(material);
                let _ = with_retry(&settings.retry, "store certificate", || {
                    let store = Arc::clone(&store);
                    let material = Arc::clone(&material);
                    blocking(settings.write_timeout, move || {
                        store.save_certificate(&material)
                    })
                })
                .await;
                debug!(fingerprint = %fingerprint, "Certificate write processed");
            }
            WriteRequest::RemoveCertificate(fingerprint) => {
                let _ = with_retry(&settings.retry, "remove certificate", || {
                    let store = Arc::clone(&store);
                    let fingerprint = fingerprint.clone();
                    blocking(settings.write_timeout, move || {
                        store.remove_certificate(&fingerprint).map(drop)
                    })
                })
                .await;
            }
            WriteRequest::Flush(reply) => {
                let outcome = match &last_save {
                    Ok(()) => Ok(()),
                    Err(e) => Err(Error::PersistenceFailed(e.to_string())),
                };
                let _ = reply.send(outcome);
            }
        }
    }
    info!("State writer stopped");
}

/// Run `op` until it succeeds or the policy gives up.
async fn with_retry<F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    error!(operation = what, attempts = attempt, error = %e, "Persistence failed, giving up");
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Persistence failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run blocking store I/O off the runtime, bounded by `timeout`.
async fn blocking<F>(timeout: Duration, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::PersistenceFailed(format!("store task failed: {join}"))),
        Err(_) => Err(Error::PersistenceFailed(format!(
            "store write timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
