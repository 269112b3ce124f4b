//! Process-local store for secret material.
//!
//! Secrets (runtime keys, tunnel private keys) live in fixed-capacity
//! regions that are never reallocated, are requested as non-swappable
//! through a [`MemoryLocker`], and are overwritten with zeros on release.
//! Page locking is best-effort hardening: when the platform refuses, the
//! store logs a warning and keeps going.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Opaque reference to a secret region inside a [`SecureMemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretHandle(u64);

impl SecretHandle {
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Capability for pinning memory so it cannot be paged out.
pub trait MemoryLocker: Send + Sync {
    /// Request that `region` stays resident.
    fn lock(&self, region: &[u8]) -> std::io::Result<()>;
    /// Undo a successful [`lock`](Self::lock).
    fn unlock(&self, region: &[u8]);
    /// Short name for log output.
    fn name(&self) -> &'static str;
}

/// `mlock(2)`-backed locker on unix; reports `Unsupported` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformLocker;

impl MemoryLocker for PlatformLocker {
    #[cfg(unix)]
    fn lock(&self, region: &[u8]) -> std::io::Result<()> {
        // SAFETY: the pointer and length describe a live allocation owned by
        // the caller for the duration of the call; mlock does not access it.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::mlock(region.as_ptr().cast(), region.len()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn lock(&self, _region: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "memory locking not available on this platform",
        ))
    }

    #[cfg(unix)]
    fn unlock(&self, region: &[u8]) {
        // SAFETY: same region that was passed to a successful mlock.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::munlock(region.as_ptr().cast(), region.len()) };
        if ret != 0 {
            debug!(error = %std::io::Error::last_os_error(), "munlock failed");
        }
    }

    #[cfg(not(unix))]
    fn unlock(&self, _region: &[u8]) {}

    fn name(&self) -> &'static str {
        "platform"
    }
}

/// Locker that never pins anything. Used where locking is undesired (tests,
/// containers with a zero `RLIMIT_MEMLOCK`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLocker;

impl MemoryLocker for NoopLocker {
    fn lock(&self, _region: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    fn unlock(&self, _region: &[u8]) {}

    fn name(&self) -> &'static str {
        "noop"
    }
}

struct Region {
    buf: Box<[u8]>,
    len: usize,
    locked: bool,
}

/// Holder of process-lifetime secrets.
pub struct SecureMemoryStore {
    locker: Box<dyn MemoryLocker>,
    regions: Mutex<HashMap<u64, Region>>,
    next_id: AtomicU64,
    /// Only the first lock failure is logged at warn level.
    lock_warned: AtomicBool,
}

impl std::fmt::Debug for SecureMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureMemoryStore")
            .field("locker", &self.locker.name())
            .field("regions", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for SecureMemoryStore {
    fn default() -> Self {
        Self::new(Box::new(PlatformLocker))
    }
}

impl SecureMemoryStore {
    pub fn new(locker: Box<dyn MemoryLocker>) -> Self {
        Self {
            locker,
            regions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            lock_warned: AtomicBool::new(false),
        }
    }

    fn regions(&self) -> MutexGuard<'_, HashMap<u64, Region>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a zeroed region of `size` bytes.
    pub fn allocate(&self, size: usize) -> SecretHandle {
        let buf = vec![0u8; size].into_boxed_slice();
        let locked = if size == 0 {
            false
        } else {
            match self.locker.lock(&buf) {
                Ok(()) => true,
                Err(e) => {
                    if self.lock_warned.swap(true, Ordering::Relaxed) {
                        debug!(error = %e, size, "Secret region not locked");
                    } else {
                        warn!(
                            error = %e,
                            locker = self.locker.name(),
                            "Could not lock secret memory; continuing without page locking"
                        );
                    }
                    false
                }
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.regions().insert(
            id,
            Region {
                buf,
                len: 0,
                locked,
            },
        );
        SecretHandle(id)
    }

    /// Copy `bytes` into the region, replacing (and zeroing) its old contents.
    pub fn write(&self, handle: SecretHandle, bytes: &[u8]) -> Result<(), CryptoError> {
        let mut regions = self.regions();
        let region = regions
            .get_mut(&handle.0)
            .ok_or(CryptoError::UnknownHandle(handle.0))?;
        if bytes.len() > region.buf.len() {
            return Err(CryptoError::SecretTooLarge {
                capacity: region.buf.len(),
                actual: bytes.len(),
            });
        }
        region.buf.zeroize();
        region.buf[..bytes.len()].copy_from_slice(bytes);
        region.len = bytes.len();
        Ok(())
    }

    /// Allocate an exactly-sized region holding `bytes`.
    pub fn store(&self, bytes: &[u8]) -> Result<SecretHandle, CryptoError> {
        let handle = self.allocate(bytes.len());
        self.write(handle, bytes)?;
        Ok(handle)
    }

    /// Defensive copy of the secret; zeroed when the returned value drops.
    pub fn read(&self, handle: SecretHandle) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let regions = self.regions();
        let region = regions
            .get(&handle.0)
            .ok_or(CryptoError::UnknownHandle(handle.0))?;
        Ok(Zeroizing::new(region.buf[..region.len].to_vec()))
    }

    /// Read a 32-byte key without going through the heap.
    pub fn read_key(&self, handle: SecretHandle) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let regions = self.regions();
        let region = regions
            .get(&handle.0)
            .ok_or(CryptoError::UnknownHandle(handle.0))?;
        if region.len != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: region.len,
            });
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&region.buf[..32]);
        Ok(key)
    }

    /// Overwrite the region with zeros and release it.
    ///
    /// Returns `false` if the handle was already wiped.
    pub fn wipe(&self, handle: SecretHandle) -> bool {
        let region = self.regions().remove(&handle.0);
        region.is_some_and(|mut region| {
            self.release(&mut region);
            true
        })
    }

    /// Wipe every region. Called on shutdown, on fatal errors and on drop.
    pub fn wipe_all(&self) -> usize {
        let drained: Vec<Region> = self.regions().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for mut region in drained {
            self.release(&mut region);
        }
        if count > 0 {
            debug!(count, "Wiped secret regions");
        }
        count
    }

    fn release(&self, region: &mut Region) {
        region.buf.zeroize();
        region.len = 0;
        if region.locked {
            self.locker.unlock(&region.buf);
            region.locked = false;
        }
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store that never page-locks, for tests that would otherwise hit
/// `RLIMIT_MEMLOCK` on constrained CI runners.
#[cfg(any(test, feature = "test-utils"))]
pub fn unlocked_store() -> SecureMemoryStore {
    SecureMemoryStore::new(Box::new(NoopLocker))
}

impl Drop for SecureMemoryStore {
    fn drop(&mut self) {
        self.wipe_all();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Locker that always refuses, to exercise the degrade-to-warning path.
    struct RefusingLocker;

    impl MemoryLocker for RefusingLocker {
        fn lock(&self, _region: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "RLIMIT_MEMLOCK exceeded",
            ))
        }
        fn unlock(&self, _region: &[u8]) {
            panic!("unlock must not be called for a region that was never locked");
        }
        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    fn store() -> SecureMemoryStore {
        SecureMemoryStore::new(Box::new(NoopLocker))
    }

    #[test]
    fn write_then_read_returns_copy() {
        let store = store();
        let handle = store.allocate(16);
        store.write(handle, b"hunter2").unwrap();

        let copy = store.read(handle).unwrap();
        assert_eq!(copy.as_slice(), b"hunter2");
    }

    #[test]
    fn overwrite_shorter_secret_drops_old_tail() {
        let store = store();
        let handle = store.allocate(16);
        store.write(handle, b"long-secret-1234").unwrap();
        store.write(handle, b"short").unwrap();
        assert_eq!(store.read(handle).unwrap().as_slice(), b"short");
    }

    #[test]
    fn write_larger_than_region_fails() {
        let store = store();
        let handle = store.allocate(4);
        let err = store.write(handle, b"too long").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::SecretTooLarge {
                capacity: 4,
                actual: 8
            }
        ));
    }

    #[test]
    fn read_after_wipe_fails() {
        let store = store();
        let handle = store.store(b"private key bytes").unwrap();
        assert!(store.wipe(handle));
        assert!(matches!(
            store.read(handle),
            Err(CryptoError::UnknownHandle(_))
        ));
        assert!(!store.wipe(handle), "second wipe is a no-op");
    }

    #[test]
    fn wipe_all_invalidates_every_handle() {
        let store = store();
        let a = store.store(b"alpha").unwrap();
        let b = store.store(&[7u8; 32]).unwrap();
        assert_eq!(store.wipe_all(), 2);
        assert!(store.is_empty());
        assert!(store.read(a).is_err());
        assert!(store.read_key(b).is_err());
    }

    #[test]
    fn read_key_requires_32_bytes() {
        let store = store();
        let key = store.store(&[9u8; 32]).unwrap();
        assert_eq!(*store.read_key(key).unwrap(), [9u8; 32]);

        let short = store.store(&[1u8; 16]).unwrap();
        assert!(matches!(
            store.read_key(short),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn lock_failure_degrades_to_warning() {
        let store = SecureMemoryStore::new(Box::new(RefusingLocker));
        let handle = store.store(b"still usable").unwrap();
        assert_eq!(store.read(handle).unwrap().as_slice(), b"still usable");
        // RefusingLocker panics on unlock; wiping must not try to unlock.
        assert!(store.wipe(handle));
    }

    #[test]
    fn handles_are_unique() {
        let store = store();
        let a = store.allocate(1);
        let b = store.allocate(1);
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_writers_do_not_interfere() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0u8..8)
            .map(|i| {
                let s = Arc::clone(&store);
                std::thread::spawn(move || {
                    let h = s.store(&[i; 32]).unwrap();
                    (i, h)
                })
            })
            .collect();
        for t in handles {
            let (i, h) = t.join().unwrap();
            assert_eq!(*store.read_key(h).unwrap(), [i; 32]);
        }
    }

    #[test]
    fn debug_output_does_not_leak_contents() {
        let store = store();
        store.store(b"topsecret").unwrap();
        let dbg = format!("{store:?}");
        assert!(!dbg.contains("topsecret"));
    }
}
