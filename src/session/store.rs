//! Durable session store.
//!
//! A single JSON document maps session keys to entries. The file is shared
//! across processes, so every mutation goes through a sibling lock file and
//! the atomic write-then-rename pattern. Reads are served from a short-lived
//! in-process cache validated against the file's modification time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::session::entry::SessionEntry;
use crate::session::key::SessionKey;
use crate::util::fs::{rename_aside, write_json_atomic};
use crate::util::time::now_ms;

/// Snapshot type handed to callers and mutators.
pub type SessionMap = BTreeMap<SessionKey, SessionEntry>;

/// Cache TTL for read snapshots.
const CACHE_TTL: Duration = Duration::from_secs(45);
/// Entries untouched for longer than this are pruned.
const MAX_ENTRY_AGE_MS: i64 = 30 * 24 * 3600 * 1000;
/// Hard cap on stored entries; least-recently-updated are evicted.
const MAX_ENTRIES: usize = 500;
/// File size that triggers rotation of the oldest half.
const ROTATE_BYTES: usize = 10 * 1024 * 1024;

/// Out-of-band notices emitted by the store.
#[derive(Debug, Clone)]
pub enum StoreNotice {
    /// The store file was corrupt, renamed aside, and recreated empty.
    Reset { path: String },
}

/// Lock-file contents, for stale detection and debugging.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockStamp {
    pid: u32,
    started_at: i64,
}

/// Tunable lock timing; tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub retry_every: Duration,
    pub timeout: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retry_every: Duration::from_millis(25),
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

struct CacheSlot {
    map: SessionMap,
    mtime: Option<SystemTime>,
    loaded_at: Instant,
}

/// File-backed session store.
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_settings: LockSettings,
    cache: Mutex<Option<CacheSlot>>,
    notices: broadcast::Sender<StoreNotice>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_lock_settings(path, LockSettings::default())
    }

    pub fn with_lock_settings(path: impl Into<PathBuf>, lock_settings: LockSettings) -> Arc<Self> {
        let path = path.into();
        let lock_path = {
            let mut s = path.as_os_str().to_os_string();
            s.push(".lock");
            PathBuf::from(s)
        };
        let (notices, _) = broadcast::channel(16);
        Arc::new(Self {
            path,
            lock_path,
            lock_settings,
            cache: Mutex::new(None),
            notices,
        })
    }

    /// Subscribe to store notices (`store.reset`).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load a snapshot copy of the store.
    ///
    /// Served from the cache while it is fresh and the file's mtime is
    /// unchanged; otherwise re-read from disk.
    pub async fn load(&self) -> Result<SessionMap, StoreError> {
        let mtime = file_mtime(&self.path).await;

        let mut cache = self.cache.lock().await;
        if let Some(slot) = cache.as_ref()
            && slot.loaded_at.elapsed() < CACHE_TTL
            && slot.mtime == mtime
        {
            return Ok(slot.map.clone());
        }

        let map = self.read_file().await?;
        let snapshot = map.clone();
        *cache = Some(CacheSlot {
            map,
            mtime: file_mtime(&self.path).await,
            loaded_at: Instant::now(),
        });
        Ok(snapshot)
    }

    /// Mutate the store under the cross-process lock.
    ///
    /// Re-reads the file (bypassing the cache), applies the mutator to a
    /// private snapshot, runs maintenance, writes atomically, and invalidates
    /// the cache. The lock is released on every exit path.
    ///
    /// A lock timeout is retried once after 500 ms before surfacing.
    pub async fn update<R>(
        &self,
        mutate: impl FnOnce(&mut SessionMap) -> R,
    ) -> Result<R, StoreError> {
        let guard = match self.acquire_lock().await {
            Ok(guard) => guard,
            Err(StoreError::LockTimeout { .. }) => {
                debug!(path = %self.path.display(), "Lock timed out, retrying once");
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.acquire_lock().await?
            }
            Err(e) => return Err(e),
        };

        let result = self.update_locked(mutate).await;
        drop(guard);
        result
    }

    async fn update_locked<R>(
        &self,
        mutate: impl FnOnce(&mut SessionMap) -> R,
    ) -> Result<R, StoreError> {
        let mut map = self.read_file().await?;
        let out = mutate(&mut map);

        run_maintenance(&mut map);
        self.maybe_rotate(&mut map).await;

        write_json_atomic(&self.path, &map).await?;
        *self.cache.lock().await = None;
        Ok(out)
    }

    /// Read and parse the store file. A corrupt file is renamed aside, a
    /// `store.reset` notice is emitted, and an empty map is returned.
    async fn read_file(&self) -> Result<SessionMap, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionMap::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<SessionMap>(&bytes) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Session store corrupt, resetting");
                if let Err(rename_err) = rename_aside(&self.path).await {
                    warn!(error = %rename_err, "Failed to move corrupt store aside");
                }
                let _ = self.notices.send(StoreNotice::Reset {
                    path: self.path.display().to_string(),
                });
                Ok(SessionMap::new())
            }
        }
    }

    async fn acquire_lock(&self) -> Result<LockGuard, StoreError> {
        let started = Instant::now();
        let mut evicted_stale = false;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    let stamp = LockStamp {
                        pid: std::process::id(),
                        started_at: now_ms(),
                    };
                    let json = serde_json::to_vec(&stamp)?;
                    tokio::fs::write(&self.lock_path, json).await?;
                    return Ok(LockGuard {
                        lock_path: self.lock_path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !evicted_stale && self.lock_is_stale().await {
                        warn!(path = %self.lock_path.display(), "Evicting stale session lock");
                        let _ = tokio::fs::remove_file(&self.lock_path).await;
                        evicted_stale = true;
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= self.lock_settings.timeout {
                return Err(StoreError::LockTimeout {
                    path: self.path.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.lock_settings.retry_every).await;
        }
    }

    async fn lock_is_stale(&self) -> bool {
        let stale_ms = self.lock_settings.stale_after.as_millis() as i64;

        if let Ok(bytes) = tokio::fs::read(&self.lock_path).await
            && let Ok(stamp) = serde_json::from_slice::<LockStamp>(&bytes)
        {
            return now_ms() - stamp.started_at > stale_ms;
        }
        // Unreadable stamp: fall back to the lock file's own mtime.
        match file_mtime(&self.lock_path).await {
            Some(mtime) => match mtime.elapsed() {
                Ok(age) => age > self.lock_settings.stale_after,
                Err(_) => false,
            },
            None => false,
        }
    }

    async fn maybe_rotate(&self, map: &mut SessionMap) {
        let size = match serde_json::to_vec(&map) {
            Ok(bytes) => bytes.len(),
            Err(_) => return,
        };
        if size <= ROTATE_BYTES || map.len() < 2 {
            return;
        }

        let mut by_age: Vec<(SessionKey, i64)> = map
            .iter()
            .map(|(k, e)| (k.clone(), e.updated_at))
            .collect();
        by_age.sort_by_key(|(_, updated_at)| *updated_at);

        let archive_count = by_age.len() / 2;
        let mut archived = SessionMap::new();
        for (key, _) in by_age.into_iter().take(archive_count) {
            if let Some(entry) = map.remove(&key) {
                archived.insert(key, entry);
            }
        }

        let archive_path = self.path.with_extension(format!("archive.{}", now_ms()));
        match serde_json::to_vec_pretty(&archived) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&archive_path, bytes).await {
                    warn!(error = %e, "Failed to write session archive");
                } else {
                    info!(
                        archived = archive_count,
                        path = %archive_path.display(),
                        "Rotated session store"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session archive"),
        }
    }
}

/// Holds the lock file; removes it when dropped.
struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn run_maintenance(map: &mut SessionMap) {
    let now = now_ms();
    map.retain(|_, entry| now - entry.updated_at <= MAX_ENTRY_AGE_MS);

    if map.len() > MAX_ENTRIES {
        let mut by_age: Vec<(SessionKey, i64)> = map
            .iter()
            .map(|(k, e)| (k.clone(), e.updated_at))
            .collect();
        by_age.sort_by_key(|(_, updated_at)| *updated_at);
        let excess = map.len() - MAX_ENTRIES;
        for (key, _) in by_age.into_iter().take(excess) {
            map.remove(&key);
        }
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_lock() -> LockSettings {
        LockSettings {
            retry_every: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
            stale_after: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn load_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));

        let key = SessionKey::main("home");
        store
            .update(|map| {
                map.insert(key.clone(), SessionEntry::new());
            })
            .await
            .unwrap();

        let map = store.load().await.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&key));
        // Lock file released.
        assert!(!tmp.path().join("sessions.json.lock").exists());
    }

    #[tokio::test]
    async fn identity_update_preserves_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));

        store
            .update(|map| {
                map.insert(SessionKey::main("a"), SessionEntry::new());
            })
            .await
            .unwrap();
        let before = store.load().await.unwrap();
        store.update(|_| {}).await.unwrap();
        let after = store.load().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn mutator_sees_private_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));

        let snapshot = store.load().await.unwrap();
        store
            .update(|map| {
                map.insert(SessionKey::main("a"), SessionEntry::new());
            })
            .await
            .unwrap();
        // The earlier snapshot is untouched.
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn corrupt_store_resets_and_notifies() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        tokio::fs::write(&path, b"{ this is not json").await.unwrap();

        let store = SessionStore::new(&path);
        let mut notices = store.subscribe();

        let map = store.load().await.unwrap();
        assert!(map.is_empty());

        let notice = notices.try_recv().unwrap();
        match notice {
            StoreNotice::Reset { path: p } => assert!(p.ends_with("sessions.json")),
        }

        // Original contents were moved aside, not destroyed.
        let mut found_aside = false;
        let mut dir = tokio::fs::read_dir(tmp.path()).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains("corrupt.") {
                found_aside = true;
            }
        }
        assert!(found_aside);
    }

    #[tokio::test]
    async fn stale_lock_is_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        let lock_path = tmp.path().join("sessions.json.lock");

        // A lock stamped well in the past.
        let stamp = serde_json::json!({ "pid": 1, "startedAt": 1000i64 });
        tokio::fs::write(&lock_path, serde_json::to_vec(&stamp).unwrap())
            .await
            .unwrap();

        let store = SessionStore::with_lock_settings(&path, fast_lock());
        store
            .update(|map| {
                map.insert(SessionKey::main("a"), SessionEntry::new());
            })
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fresh_lock_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        let lock_path = tmp.path().join("sessions.json.lock");

        let settings = LockSettings {
            stale_after: Duration::from_secs(3600),
            ..fast_lock()
        };
        // A lock held right now by someone else.
        let stamp = serde_json::json!({ "pid": 1, "startedAt": now_ms() });
        tokio::fs::write(&lock_path, serde_json::to_vec(&stamp).unwrap())
            .await
            .unwrap();

        let store = SessionStore::with_lock_settings(&path, settings);
        let err = store.update(|_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn maintenance_prunes_old_and_caps_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));

        store
            .update(|map| {
                // One ancient entry.
                let mut old = SessionEntry::new();
                old.updated_at = now_ms() - MAX_ENTRY_AGE_MS - 1000;
                map.insert(SessionKey::new("agent:old:main"), old);

                // 510 fresh entries with increasing recency.
                for i in 0..510 {
                    let mut entry = SessionEntry::new();
                    entry.updated_at = now_ms() - (510 - i);
                    map.insert(SessionKey::new(format!("agent:a{i}:main")), entry);
                }
            })
            .await
            .unwrap();

        let map = store.load().await.unwrap();
        assert_eq!(map.len(), MAX_ENTRIES);
        assert!(!map.contains_key(&SessionKey::new("agent:old:main")));
        // The least-recently-updated of the fresh batch were evicted.
        assert!(!map.contains_key(&SessionKey::new("agent:a0:main")));
        assert!(map.contains_key(&SessionKey::new("agent:a509:main")));
    }

    #[tokio::test]
    async fn cache_serves_unchanged_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.json"));

        store
            .update(|map| {
                map.insert(SessionKey::main("a"), SessionEntry::new());
            })
            .await
            .unwrap();

        let first = store.load().await.unwrap();
        // Delete the file behind the store's back; cached mtime lookup fails,
        // forcing a re-read that observes the deletion.
        tokio::fs::remove_file(store.path()).await.unwrap();
        let second = store.load().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
