//! Encrypted, atomic, backed-up persistence of tunnel state.
//!
//! Directory layout:
//!
//! ```text
//! <state_dir>/
//!   store.key                          root keypair secret (0600)
//!   state.enc                          current snapshot
//!   state.enc.tmp                      in-flight write
//!   backups/state-<millis>-<seq>.bak   older snapshots, backup key
//!   certs/<fingerprint-hex>.cert.enc   certificate blobs, certificate key
//! ```
//!
//! Every file is `sealed_box(chacha(payload))`: the inner layer uses one of
//! the derived runtime keys, the outer layer is sealed to the store public
//! key. All I/O here is blocking; async callers go through
//! [`StateWriter`](super::StateWriter).

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use porthop_crypto::{
    CertificateMaterial, CertificateMetadata, SecureMemoryStore, SymmetricKey, open_layered,
    seal_layered,
};

use super::keys::RuntimeSecrets;
use super::snapshot::StateSnapshot;
use crate::error::{Error, Result};

pub const STATE_FILE: &str = "state.enc";
pub const STATE_TMP_FILE: &str = "state.enc.tmp";
pub const BACKUP_DIR: &str = "backups";
pub const CERT_DIR: &str = "certs";
pub const STORE_KEY_FILE: &str = "store.key";

const BACKUP_PREFIX: &str = "state-";
const BACKUP_SUFFIX: &str = ".bak";
const CERT_SUFFIX: &str = ".cert.enc";

/// A backup file, ordered by (timestamp, sequence).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackupEntry {
    pub written_at_millis: u128,
    pub sequence: u64,
    pub path: PathBuf,
}

impl BackupEntry {
    fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix(BACKUP_PREFIX)?.strip_suffix(BACKUP_SUFFIX)?;
        let (millis, seq) = stem.split_once('-')?;
        Some(Self {
            written_at_millis: millis.parse().ok()?,
            sequence: seq.parse().ok()?,
            path,
        })
    }
}

/// On-disk shape of a certificate blob before sealing.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct CertificateBlob {
    #[zeroize(skip)]
    metadata: CertificateMetadata,
    certificate_der: String,
    private_key_der: String,
}

/// Encrypted state directory.
pub struct SecureStateStore {
    dir: PathBuf,
    secrets: RuntimeSecrets,
    backup_retention: usize,
    /// Serializes every write; holds the sequence of the last snapshot
    /// this instance wrote.
    write_lock: Mutex<Option<u64>>,
}

impl std::fmt::Debug for SecureStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStateStore")
            .field("dir", &self.dir)
            .field("backup_retention", &self.backup_retention)
            .finish_non_exhaustive()
    }
}

impl SecureStateStore {
    /// Open (creating if needed) the state directory and load the store key.
    pub fn open(
        dir: impl Into<PathBuf>,
        backup_retention: usize,
        memory: Arc<SecureMemoryStore>,
    ) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        create_private_dir(&dir.join(BACKUP_DIR))?;
        create_private_dir(&dir.join(CERT_DIR))?;

        let secrets = RuntimeSecrets::load_or_create(&dir.join(STORE_KEY_FILE), memory)?;
        info!(
            dir = %dir.display(),
            store_key = %secrets.fingerprint(),
            backup_retention,
            "State store opened"
        );

        Ok(Self {
            dir,
            secrets,
            backup_retention: backup_retention.max(1),
            write_lock: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub const fn secrets(&self) -> &RuntimeSecrets {
        &self.secrets
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    pub fn certificate_path(&self, fingerprint: &str) -> PathBuf {
        self.dir
            .join(CERT_DIR)
            .join(format!("{}{CERT_SUFFIX}", fingerprint.replace(':', "")))
    }

    /// Durably replace the current snapshot and add a backup.
    ///
    /// A snapshot older than the last one written is skipped, so a save that
    /// outlived its timeout cannot overwrite newer state.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut last_written = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = *last_written
            && snapshot.sequence < last
        {
            debug!(sequence = snapshot.sequence, last, "Skipping stale snapshot");
            return Ok(());
        }
        let framed = snapshot.to_framed_bytes()?;

        let current = self.seal(&self.secrets.live_key()?, &framed)?;
        write_atomic(&self.state_path(), &self.dir.join(STATE_TMP_FILE), &current)?;

        let backup = self.seal(&self.secrets.backup_key()?, &framed)?;
        let name = format!(
            "{BACKUP_PREFIX}{}-{}{BACKUP_SUFFIX}",
            unix_millis(),
            snapshot.sequence
        );
        let backup_path = self.backup_dir().join(name);
        write_atomic(&backup_path, &tmp_path(&backup_path), &backup)?;

        let pruned = self.prune_backups()?;
        *last_written = Some(snapshot.sequence);
        debug!(
            sequence = snapshot.sequence,
            tunnels = snapshot.tunnels.len(),
            bytes = current.len(),
            pruned,
            "Snapshot persisted"
        );
        Ok(())
    }

    /// Load the current snapshot, falling back to the newest backup that
    /// verifies. The recovered backup becomes the current file.
    pub fn load(&self) -> Result<StateSnapshot> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tmp = self.dir.join(STATE_TMP_FILE);
        if tmp.exists() {
            debug!(path = %tmp.display(), "Removing interrupted write");
            fs::remove_file(&tmp)?;
        }

        let path = self.state_path();
        let current_failure = match fs::read(&path) {
            Ok(bytes) => match self.open_snapshot(&self.secrets.live_key()?, &bytes) {
                Ok(snapshot) => {
                    info!(
                        sequence = snapshot.sequence,
                        tunnels = snapshot.tunnels.len(),
                        "Loaded state"
                    );
                    return Ok(snapshot);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Current state unreadable, trying backups");
                    Some(e)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(Error::Io(e)),
        };

        let backups = self.list_backups()?;
        if backups.is_empty() {
            return match current_failure {
                Some(e) => Err(Error::StateCorrupt(format!(
                    "state file unreadable and no backups: {e}"
                ))),
                None => {
                    info!("No previous state, starting empty");
                    Ok(StateSnapshot::empty())
                }
            };
        }

        let backup_key = self.secrets.backup_key()?;
        for entry in &backups {
            let snapshot = fs::read(&entry.path)
                .map_err(Error::from)
                .and_then(|bytes| self.open_snapshot(&backup_key, &bytes));
            match snapshot {
                Ok(snapshot) => {
                    let framed = snapshot.to_framed_bytes()?;
                    let current = self.seal(&self.secrets.live_key()?, &framed)?;
                    write_atomic(&path, &tmp, &current)?;
                    warn!(
                        backup = %entry.path.display(),
                        sequence = snapshot.sequence,
                        "Restored state from backup"
                    );
                    return Ok(snapshot);
                }
                Err(e) => {
                    warn!(backup = %entry.path.display(), error = %e, "Backup unreadable");
                }
            }
        }

        Err(Error::StateCorrupt(format!(
            "no verifiable state: current file {}, {} backups failed",
            if current_failure.is_some() { "corrupt" } else { "missing" },
            backups.len()
        )))
    }

    /// Backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.backup_dir())? {
            if let Some(backup) = BackupEntry::parse(entry?.path()) {
                entries.push(backup);
            }
        }
        entries.sort_unstable_by(|a, b| b.cmp(a));
        Ok(entries)
    }

    fn prune_backups(&self) -> Result<usize> {
        let backups = self.list_backups()?;
        let mut pruned = 0;
        for entry in backups.iter().skip(self.backup_retention) {
            match fs::remove_file(&entry.path) {
                Ok(()) => pruned += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(persistence("prune backup", &entry.path, &e)),
            }
        }
        Ok(pruned)
    }

    /// Persist a certificate with its private key, sealed.
    pub fn save_certificate(&self, material: &CertificateMaterial) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let blob = CertificateBlob {
            metadata: material.metadata.clone(),
            certificate_der: hex::encode(&material.certificate_der),
            private_key_der: hex::encode(&*material.private_key_der),
        };
        let json = Zeroizing::new(
            serde_json::to_vec(&blob)
                .map_err(|e| Error::PersistenceFailed(format!("serialize certificate: {e}")))?,
        );
        let sealed = self.seal(&self.secrets.certificate_key()?, &json)?;
        let path = self.certificate_path(&material.metadata.fingerprint);
        write_atomic(&path, &tmp_path(&path), &sealed)?;
        debug!(fingerprint = %material.metadata.fingerprint, "Certificate blob stored");
        Ok(())
    }

    /// Read back a certificate blob and check it against its fingerprint.
    pub fn load_certificate(&self, fingerprint: &str) -> Result<CertificateMaterial> {
        let path = self.certificate_path(fingerprint);
        let bytes = fs::read(&path)?;
        let json = open_layered(
            &self.secrets.certificate_key()?,
            &self.secrets.store_secret()?,
            &bytes,
        )
        .map_err(|e| Error::StateCorrupt(format!("certificate {fingerprint}: {e}")))?;
        let blob: CertificateBlob = serde_json::from_slice(&json)
            .map_err(|e| Error::StateCorrupt(format!("certificate {fingerprint}: {e}")))?;
        if !blob.metadata.matches_fingerprint(fingerprint) {
            return Err(Error::StateCorrupt(format!(
                "certificate blob {} holds {}",
                fingerprint, blob.metadata.fingerprint
            )));
        }

        let certificate_der = hex::decode(&blob.certificate_der)
            .map_err(|e| Error::StateCorrupt(format!("certificate {fingerprint}: {e}")))?;
        let private_key_der = Zeroizing::new(
            hex::decode(&blob.private_key_der)
                .map_err(|e| Error::StateCorrupt(format!("certificate {fingerprint}: {e}")))?,
        );
        CertificateMaterial::from_parts(blob.metadata.clone(), certificate_der, private_key_der)
            .map_err(|e| Error::StateCorrupt(e.to_string()))
    }

    /// Delete a certificate blob. Returns false if it did not exist.
    pub fn remove_certificate(&self, fingerprint: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.certificate_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(path.parent().unwrap_or(self.dir.as_path()))?;
                debug!(fingerprint, "Certificate blob removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(persistence("remove certificate", &path, &e)),
        }
    }

    fn seal(&self, key: &SymmetricKey, payload: &[u8]) -> Result<Vec<u8>> {
        seal_layered(key, self.secrets.public_key(), payload)
            .map_err(|e| Error::PersistenceFailed(format!("seal: {e}")))
    }

    fn open_snapshot(&self, key: &SymmetricKey, sealed: &[u8]) -> Result<StateSnapshot> {
        let framed = open_layered(key, &self.secrets.store_secret()?, sealed)
            .map_err(|e| Error::StateCorrupt(e.to_string()))?;
        StateSnapshot::from_framed_bytes(&framed)
    }
}

fn persistence(action: &str, path: &Path, e: &std::io::Error) -> Error {
    Error::PersistenceFailed(format!("{action} {}: {e}", path.display()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `bytes` to `tmp`, fsync, rename over `path`, fsync the directory.
fn write_atomic(path: &Path, tmp: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let write = || -> std::io::Result<()> {
        let mut file = options.open(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(tmp);
        return Err(persistence("write", path, &e));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| persistence("fsync", dir, &e))?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
