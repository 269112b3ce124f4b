#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use porthop_crypto::{CertificateAuthority, unlocked_store};

use super::*;
use crate::tunnel::{Application, TunnelRecord, TunnelState};

fn open(dir: &Path, retention: usize) -> SecureStateStore {
    SecureStateStore::open(dir, retention, Arc::new(unlocked_store())).unwrap()
}

fn record(key: &str, port: u16) -> TunnelRecord {
    let backend = format!("127.0.0.1:{}", 8000 + port % 100).parse().unwrap();
    let mut record = TunnelRecord::pending(&Application::new(key, backend), 1_700_000_000);
    record.state = TunnelState::Active;
    record.public_port = port;
    record.certificate_fingerprint = format!("fp-{key}");
    record
}

fn snapshot(sequence: u64, keys: &[(&str, u16)]) -> StateSnapshot {
    StateSnapshot::new(
        sequence,
        1_700_000_000 + i64::try_from(sequence).unwrap(),
        keys.iter().map(|(k, p)| record(k, *p)).collect(),
        Vec::new(),
    )
}

#[test]
fn empty_directory_loads_empty_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 3);
    let loaded = store.load().unwrap();
    assert!(loaded.is_empty());
    assert_eq!(loaded.sequence, 0);
}

#[test]
fn save_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let saved = snapshot(3, &[("web", 5001), ("api", 5002)]);
    {
        let store = open(dir.path(), 3);
        store.save(&saved).unwrap();
    }

    let restarted = open(dir.path(), 3);
    let loaded = restarted.load().unwrap();
    assert_eq!(loaded.tunnels, saved.tunnels);
    assert_eq!(loaded.sequence, 3);
}

#[test]
fn state_file_is_not_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 3);
    store.save(&snapshot(1, &[("very-recognizable-key", 5001)])).unwrap();

    let raw = fs::read(store.state_path()).unwrap();
    let needle = b"very-recognizable-key";
    assert!(!raw.windows(needle.len()).any(|w| w == needle));
    assert!(!dir.path().join(STATE_TMP_FILE).exists());
}

#[test]
fn corrupt_state_falls_back_to_newest_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 5);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    store.save(&snapshot(2, &[("web", 5007)])).unwrap();

    let mut raw = fs::read(store.state_path()).unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xff;
    fs::write(store.state_path(), &raw).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.sequence, 2);
    assert_eq!(loaded.tunnels[0].public_port, 5007);

    // The backup was restored as the current file.
    let again = open(dir.path(), 5).load().unwrap();
    assert_eq!(again.sequence, 2);
}

#[test]
fn corrupt_newest_backup_uses_older_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 5);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    store.save(&snapshot(2, &[("web", 5002)])).unwrap();

    fs::write(store.state_path(), b"garbage").unwrap();
    let newest = store.list_backups().unwrap().remove(0);
    assert_eq!(newest.sequence, 2);
    fs::write(&newest.path, b"also garbage").unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.sequence, 1);
}

#[test]
fn unverifiable_state_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();

    fs::write(store.state_path(), b"garbage").unwrap();
    for entry in store.list_backups().unwrap() {
        fs::write(&entry.path, b"garbage").unwrap();
    }

    let err = store.load().unwrap_err();
    assert!(matches!(err, Error::StateCorrupt(_)));
}

#[test]
fn corrupt_state_without_backups_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    fs::write(store.state_path(), b"garbage").unwrap();
    assert!(matches!(store.load().unwrap_err(), Error::StateCorrupt(_)));
}

#[test]
fn backups_are_pruned_to_retention() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    for seq in 1..=5 {
        store.save(&snapshot(seq, &[("web", 5000)])).unwrap();
    }
    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    assert_eq!(backups[0].sequence, 5);
    assert_eq!(backups[1].sequence, 4);
}

#[test]
fn older_snapshot_never_overwrites_newer() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 5);
    store.save(&snapshot(2, &[("web", 5002)])).unwrap();
    // A late write of an earlier sequence, e.g. one that outlived its timeout.
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.sequence, 2);
    assert_eq!(loaded.tunnels[0].public_port, 5002);
    assert_eq!(store.list_backups().unwrap().len(), 1);

    // Re-saving the same sequence (a retry) still goes through.
    store.save(&snapshot(2, &[("web", 5003)])).unwrap();
    assert_eq!(store.load().unwrap().tunnels[0].public_port, 5003);
}

#[test]
fn backups_are_not_readable_with_live_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();
    let backup = fs::read(&store.list_backups().unwrap()[0].path).unwrap();
    let live = store.secrets().live_key().unwrap();
    assert!(store.open_snapshot(&live, &backup).is_err());
}

#[test]
fn interrupted_write_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();
    fs::write(dir.path().join(STATE_TMP_FILE), b"half a snapshot").unwrap();

    assert_eq!(store.load().unwrap().sequence, 1);
    assert!(!dir.path().join(STATE_TMP_FILE).exists());
}

#[test]
fn certificate_blob_roundtrip_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    let material = CertificateAuthority::new(Duration::from_secs(3_600))
        .issue("web")
        .unwrap();
    let fingerprint = material.metadata.fingerprint.clone();

    store.save_certificate(&material).unwrap();
    let path = store.certificate_path(&fingerprint);
    let raw = fs::read(&path).unwrap();
    let key_hex = hex::encode(&*material.private_key_der);
    assert!(
        !raw.windows(16)
            .any(|w| key_hex.as_bytes().windows(16).any(|k| k == w)),
        "blob must not contain the key in clear"
    );

    let restarted = open(dir.path(), 2);
    let loaded = restarted.load_certificate(&fingerprint).unwrap();
    assert_eq!(loaded.metadata, material.metadata);
    assert_eq!(loaded.certificate_der, material.certificate_der);
    assert_eq!(*loaded.private_key_der, *material.private_key_der);

    assert!(restarted.remove_certificate(&fingerprint).unwrap());
    assert!(!restarted.remove_certificate(&fingerprint).unwrap());
    assert!(restarted.load_certificate(&fingerprint).is_err());
}

#[test]
fn swapped_certificate_blob_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    let ca = CertificateAuthority::new(Duration::from_secs(3_600));
    let a = ca.issue("a").unwrap();
    let b = ca.issue("b").unwrap();
    store.save_certificate(&a).unwrap();
    store.save_certificate(&b).unwrap();

    fs::copy(
        store.certificate_path(&b.metadata.fingerprint),
        store.certificate_path(&a.metadata.fingerprint),
    )
    .unwrap();
    let err = store.load_certificate(&a.metadata.fingerprint).unwrap_err();
    assert!(matches!(err, Error::StateCorrupt(_)));
}

#[cfg(unix)]
#[test]
fn state_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2);
    store.save(&snapshot(1, &[("web", 5001)])).unwrap();

    for path in [
        store.state_path(),
        dir.path().join(STORE_KEY_FILE),
        store.list_backups().unwrap()[0].path.clone(),
    ] {
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "{}", path.display());
    }
}

#[test]
fn backup_names_parse() {
    let entry = BackupEntry::parse(PathBuf::from("/x/state-1700000000123-42.bak")).unwrap();
    assert_eq!(entry.written_at_millis, 1_700_000_000_123);
    assert_eq!(entry.sequence, 42);
    assert!(BackupEntry::parse(PathBuf::from("/x/state-abc.bak")).is_none());
    assert!(BackupEntry::parse(PathBuf::from("/x/other.txt")).is_none());
}
