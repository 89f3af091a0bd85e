//! TTL-bounded on-disk cache of muxed video files.
//!
//! An entry in the map implies a readable file on disk; removal always
//! deletes the file first so no orphaned media is left behind. Expired
//! entries are purged on every touch regardless of capacity pressure.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CACHE_FILE_VERSION: u32 = 1;

fn current_version() -> u32 {
    CACHE_FILE_VERSION
}

/// A cached conversion result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoCacheEntry {
    pub file_path: PathBuf,
    #[serde(with = "epoch_secs")]
    pub expire_time: SystemTime,
}

/// Serde helper: SystemTime ↔ u64 epoch seconds
mod epoch_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        serializer.serialize_u64(secs)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<(String, VideoCacheEntry)>,
}

struct Inner {
    entries: HashMap<String, VideoCacheEntry>,
    /// Keys in original insertion order; overwrites never reorder.
    order: VecDeque<String>,
}

/// Bounded video cache, persisted eagerly after every mutation.
#[derive(Clone)]
pub struct VideoCache {
    // tokio Mutex: file deletions happen while the lock is held, so all
    // cache operations serialize across suspension points.
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
    capacity: usize,
    shutdown_flushed: Arc<AtomicBool>,
}

impl VideoCache {
    /// Load the cache from `path` and purge anything that expired while the
    /// process was down. Missing file is a cold start; parse errors log and
    /// start empty.
    pub async fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) if file.version == CACHE_FILE_VERSION => Some(file),
                Ok(file) => {
                    warn!(
                        "Video cache file {} has unknown version {}, starting with empty cache",
                        path.display(),
                        file.version
                    );
                    None
                }
                Err(e) => {
                    warn!("Error parsing video cache file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No video cache found, starting with empty cache");
                None
            }
            Err(e) => {
                warn!("Error loading video cache file {}: {}", path.display(), e);
                None
            }
        };

        let mut entries = HashMap::new();
        let mut order = VecDeque::new();
        if let Some(file) = file {
            for (key, entry) in file.entries {
                if entries.insert(key.clone(), entry).is_none() {
                    order.push_back(key);
                }
            }
            info!("Video cache loaded with {} entries", entries.len());
        }

        let cache = Self {
            inner: Arc::new(Mutex::new(Inner { entries, order })),
            path,
            capacity,
            shutdown_flushed: Arc::new(AtomicBool::new(false)),
        };
        cache.purge_expired().await;
        cache
    }

    /// Look up a fresh entry whose file still exists on disk.
    ///
    /// Stale map entries whose file vanished are not trusted; they are
    /// dropped and `None` is returned so the caller converts again.
    pub async fn get_valid(&self, video_id: &str) -> Option<PathBuf> {
        let mut inner = self.inner.lock().await;
        Self::purge_expired_locked(&mut inner).await;

        let file_path = inner.entries.get(video_id)?.file_path.clone();
        if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
            return Some(file_path);
        }

        debug!(
            "Cached file for video {} vanished, dropping entry",
            video_id
        );
        inner.entries.remove(video_id);
        inner.order.retain(|k| k != video_id);
        // Persist the drop so the stale entry cannot resurface on restart.
        self.save_locked(&inner).await;
        None
    }

    /// Register a finished conversion. Evicts the oldest entry (deleting its
    /// file first) when capacity is exceeded, then persists the full map.
    pub async fn insert(&self, video_id: &str, file_path: PathBuf, expire_time: SystemTime) {
        let mut inner = self.inner.lock().await;
        Self::purge_expired_locked(&mut inner).await;

        let entry = VideoCacheEntry {
            file_path,
            expire_time,
        };
        if inner.entries.insert(video_id.to_string(), entry).is_none() {
            inner.order.push_back(video_id.to_string());
        }

        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.get(&oldest) {
                // File goes first; only then may the map entry disappear.
                if let Err(e) = tokio::fs::remove_file(&evicted.file_path).await {
                    warn!(
                        "Error deleting evicted video file {}: {}",
                        evicted.file_path.display(),
                        e
                    );
                }
            }
            inner.entries.remove(&oldest);
        }

        self.save_locked(&inner).await;
    }

    /// Drop every entry whose TTL has passed, deleting its file.
    pub async fn purge_expired(&self) {
        let mut inner = self.inner.lock().await;
        if Self::purge_expired_locked(&mut inner).await {
            self.save_locked(&inner).await;
        }
    }

    async fn purge_expired_locked(inner: &mut Inner) -> bool {
        let now = SystemTime::now();
        let expired: Vec<String> = inner
            .order
            .iter()
            .filter(|key| {
                inner
                    .entries
                    .get(*key)
                    .is_some_and(|e| now > e.expire_time)
            })
            .cloned()
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.get(key) {
                debug!("Video {} cache expired, deleting file", key);
                if let Err(e) = tokio::fs::remove_file(&entry.file_path).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(
                            "Error deleting expired video file {}: {}",
                            entry.file_path.display(),
                            e
                        );
                    }
                }
            }
            inner.entries.remove(key);
        }
        inner.order.retain(|k| !expired.contains(k));
        !expired.is_empty()
    }

    async fn save_locked(&self, inner: &Inner) {
        let entries: Vec<(String, VideoCacheEntry)> = inner
            .order
            .iter()
            .filter_map(|key| inner.entries.get(key).map(|e| (key.clone(), e.clone())))
            .collect();
        let file = CacheFile {
            version: CACHE_FILE_VERSION,
            entries,
        };
        let bytes = match serde_json::to_vec(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error serializing video cache: {}", e);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(
                    "Error creating video cache directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }
        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => info!("Video cache saved with {} entries", file.entries.len()),
            Err(e) => warn!("Error saving video cache file {}: {}", self.path.display(), e),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Best-effort final flush; runs at most once per process lifetime.
    pub async fn flush_on_shutdown(&self) {
        if self.shutdown_flushed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.lock().await;
        self.save_locked(&inner).await;
    }
}
