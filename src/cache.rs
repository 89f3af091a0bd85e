//! Bounded persistent key→value cache with FIFO eviction.
//!
//! Eviction removes the oldest-inserted entry; overwriting a key does not
//! refresh its position. Persistence is write-behind: every `save_every`
//! writes a full snapshot is flushed to disk, plus once at shutdown. A crash
//! loses at most the pending batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const CACHE_FILE_VERSION: u32 = 1;

fn current_version() -> u32 {
    CACHE_FILE_VERSION
}

/// On-disk cache record. Entry order is insertion order, so FIFO position
/// survives a restart. Missing fields fall back to defaults rather than
/// failing the whole load.
#[derive(Serialize, Deserialize)]
#[serde(bound(deserialize = "V: DeserializeOwned"))]
struct CacheFile<V> {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<(String, V)>,
}

struct Inner<V> {
    entries: HashMap<String, V>,
    /// Keys in original insertion order; overwrites never reorder.
    order: VecDeque<String>,
    writes_since_save: u32,
}

/// Key→value store bounded to `capacity` entries, persisted as JSON.
#[derive(Clone)]
pub struct BoundedPersistentCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    path: PathBuf,
    capacity: usize,
    save_every: u32,
    shutdown_flushed: Arc<AtomicBool>,
}

impl<V> BoundedPersistentCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Load the cache from `path`. A missing file is a cold start; any other
    /// read or parse error is logged and yields an empty cache.
    pub async fn load(path: impl Into<PathBuf>, capacity: usize, save_every: u32) -> Self {
        let path = path.into();
        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheFile<V>>(&bytes) {
                Ok(file) if file.version == CACHE_FILE_VERSION => Some(file),
                Ok(file) => {
                    warn!(
                        "Cache file {} has unknown version {}, starting with empty cache",
                        path.display(),
                        file.version
                    );
                    None
                }
                Err(e) => {
                    warn!("Error parsing cache file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No cache found at {}, starting with empty cache", path.display());
                None
            }
            Err(e) => {
                warn!("Error loading cache file {}: {}", path.display(), e);
                None
            }
        };

        let mut entries = HashMap::new();
        let mut order = VecDeque::new();
        if let Some(file) = file {
            for (key, value) in file.entries {
                if entries.insert(key.clone(), value).is_none() {
                    order.push_back(key);
                }
            }
            info!("Cache loaded with {} entries from {}", entries.len(), path.display());
        }

        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries,
                order,
                writes_since_save: 0,
            })),
            path,
            capacity,
            save_every,
            shutdown_flushed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.get(key).cloned()
    }

    /// Insert or overwrite. Evicts the oldest-inserted entry when over
    /// capacity, and schedules an async persist every `save_every` writes.
    pub fn set(&self, key: &str, value: V) {
        let should_save = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.entries.insert(key.to_string(), value).is_none() {
                inner.order.push_back(key.to_string());
            }
            while inner.entries.len() > self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.writes_since_save += 1;
            if inner.writes_since_save >= self.save_every {
                inner.writes_since_save = 0;
                true
            } else {
                false
            }
        };

        if should_save {
            let cache = self.clone();
            tokio::spawn(async move {
                cache.save().await;
            });
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> CacheFile<V> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entries = inner
            .order
            .iter()
            .filter_map(|key| inner.entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        CacheFile {
            version: CACHE_FILE_VERSION,
            entries,
        }
    }

    /// Serialize the full map and overwrite the backing file. Errors are
    /// logged and swallowed; the cache keeps serving from memory.
    pub async fn save(&self) {
        let snapshot = self.snapshot();
        let count = snapshot.entries.len();
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error serializing cache: {}", e);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Error creating cache directory {}: {}", parent.display(), e);
                return;
            }
        }
        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => info!("Cache saved with {} entries to {}", count, self.path.display()),
            Err(e) => warn!("Error saving cache file {}: {}", self.path.display(), e),
        }
    }

    /// Best-effort final flush; runs at most once per process lifetime.
    pub async fn flush_on_shutdown(&self) {
        if self.shutdown_flushed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.save().await;
    }
}
