/// Lock Manager - Named Read/Write Locks
///
/// **Core Responsibility:**
/// Hand out exclusive (and shared) locks by string key, with an explicit
/// `unlock` instead of scoped guards so a lock can outlive the call that took it.
///
/// **Map discipline:**
/// - The manager-level mutex only guards inserting/removing entries
/// - Each entry's own `RwLock` guards the resource
/// - Entries are cloned out of the map only while the map mutex is held,
///   so the reaper can tell an idle entry from one a caller is about to acquire
use autograder_common::{AutograderError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct EntryState {
    writer: Option<OwnedRwLockWriteGuard<()>>,
    readers: Vec<OwnedRwLockReadGuard<()>>,
    touched: Instant,
}

struct LockEntry {
    lock: Arc<RwLock<()>>,
    state: Mutex<EntryState>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            state: Mutex::new(EntryState {
                writer: None,
                readers: Vec::new(),
                touched: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        // A poisoned state only means a panic happened mid-update; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
pub struct LockManager {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<LockEntry>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, key: &str) -> Arc<LockEntry> {
        self.entries()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone()
    }

    fn existing(&self, key: &str) -> Option<Arc<LockEntry>> {
        self.entries().get(key).cloned()
    }

    /// Block until `key` is held exclusively.
    pub async fn lock(&self, key: &str) {
        let entry = self.entry(key);
        let guard = entry.lock.clone().write_owned().await;

        let mut state = entry.state();
        state.writer = Some(guard);
        state.touched = Instant::now();
        debug!(key = %key, "Lock acquired");
    }

    /// Acquire `key` without waiting. Returns false if it is held.
    pub fn try_lock(&self, key: &str) -> bool {
        let entry = self.entry(key);
        let Ok(guard) = entry.lock.clone().try_write_owned() else {
            return false;
        };

        let mut state = entry.state();
        state.writer = Some(guard);
        state.touched = Instant::now();
        true
    }

    pub fn unlock(&self, key: &str) -> Result<()> {
        let entry = self.existing(key).ok_or_else(|| {
            AutograderError::Lock(format!("key '{}' has no lock to unlock", key))
        })?;

        let mut state = entry.state();
        match state.writer.take() {
            Some(guard) => {
                drop(guard);
                state.touched = Instant::now();
                debug!(key = %key, "Lock released");
                Ok(())
            }
            None => Err(AutograderError::Lock(format!(
                "key '{}' is not currently locked",
                key
            ))),
        }
    }

    /// Block until `key` is held in shared mode.
    pub async fn read_lock(&self, key: &str) {
        let entry = self.entry(key);
        let guard = entry.lock.clone().read_owned().await;

        let mut state = entry.state();
        state.readers.push(guard);
        state.touched = Instant::now();
    }

    pub fn read_unlock(&self, key: &str) -> Result<()> {
        let entry = self.existing(key).ok_or_else(|| {
            AutograderError::Lock(format!("key '{}' has no lock to read-unlock", key))
        })?;

        let mut state = entry.state();
        match state.readers.pop() {
            Some(guard) => {
                drop(guard);
                state.touched = Instant::now();
                Ok(())
            }
            None => Err(AutograderError::Lock(format!(
                "key '{}' is not currently read-locked",
                key
            ))),
        }
    }

    /// Exclusive lock released when the returned guard drops.
    pub async fn lock_guard(&self, key: &str) -> LockGuard<'_> {
        self.lock(key).await;
        LockGuard {
            manager: self,
            key: key.to_string(),
        }
    }

    /// Remove entries idle for longer than `stale` that nobody holds or is waiting on.
    /// Returns the number of entries removed.
    pub fn reap_stale_once(&self, stale: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();

        entries.retain(|key, entry| {
            // Anyone else holding the Arc is mid-acquire or mid-release.
            if Arc::strong_count(entry) > 1 {
                return true;
            }

            let state = entry.state();
            if state.writer.is_some() || !state.readers.is_empty() {
                return true;
            }

            if state.touched.elapsed() < stale {
                return true;
            }

            match entry.lock.try_write() {
                Ok(_) => {
                    debug!(key = %key, "Reaping stale lock");
                    false
                }
                Err(_) => true,
            }
        });

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically reap stale entries until the handle is aborted.
    pub fn start_reaper(
        self: &Arc<Self>,
        interval: Duration,
        stale: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = manager.reap_stale_once(stale);
                if removed > 0 {
                    debug!(removed, "Reaped stale locks");
                }
            }
        })
    }
}

pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: String,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unlock(&self.key) {
            warn!(key = %self.key, error = %e, "Failed to release lock guard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_unlock_twice_errors() {
        let manager = LockManager::new();
        manager.lock("a").await;
        assert!(manager.unlock("a").is_ok());
        assert!(manager.unlock("a").is_err());
    }

    #[tokio::test]
    async fn test_unlock_unknown_key_errors() {
        let manager = LockManager::new();
        let err = manager.unlock("missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let manager = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                manager.lock("shared").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                manager.unlock("shared").unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_lock() {
        let manager = LockManager::new();
        assert!(manager.try_lock("k"));
        assert!(!manager.try_lock("k"));
        manager.unlock("k").unwrap();
        assert!(manager.try_lock("k"));
    }

    #[tokio::test]
    async fn test_read_locks_share_and_block_writer() {
        let manager = LockManager::new();
        manager.read_lock("r").await;
        manager.read_lock("r").await;
        assert!(!manager.try_lock("r"));

        manager.read_unlock("r").unwrap();
        manager.read_unlock("r").unwrap();
        assert!(manager.read_unlock("r").is_err());
        assert!(manager.try_lock("r"));
    }

    #[tokio::test]
    async fn test_reap_skips_held_and_fresh() {
        let manager = LockManager::new();
        manager.lock("held").await;
        manager.lock("idle").await;
        manager.unlock("idle").unwrap();

        assert_eq!(manager.reap_stale_once(Duration::from_secs(3600)), 0);
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.reap_stale_once(Duration::ZERO), 1);
        assert_eq!(manager.len(), 1);

        // Idempotent.
        assert_eq!(manager.reap_stale_once(Duration::ZERO), 0);
        manager.unlock("held").unwrap();
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let manager = LockManager::new();
        {
            let guard = manager.lock_guard("g").await;
            assert_eq!(guard.key(), "g");
            assert!(!manager.try_lock("g"));
        }
        assert!(manager.try_lock("g"));
    }
}
