// Local persistence: key-value storage and named response caches

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::Mutex as TokioMutex;

use super::{CacheHandle, KeyValueStore, MediaBlob, ResponseCache};
use crate::error::StoreError;

/// Key-value store held in memory, with a switch to simulate a full or broken disk
#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<TokioMutex<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    fail_prefix: Arc<Mutex<Option<String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        MemoryKeyValueStore::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail writes to keys starting with `prefix` only
    pub fn fail_writes_to(&self, prefix: Option<&str>) {
        let prefix = prefix.map(str::to_string);
        match self.fail_prefix.lock() {
            Ok(mut guard) => *guard = prefix,
            Err(poisoned) => *poisoned.into_inner() = prefix,
        }
    }

    fn write_fails(&self, key: &str) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return true;
        }
        let prefix = match self.fail_prefix.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        prefix.map_or(false, |prefix| key.starts_with(&prefix))
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Store a raw value, bypassing failure injection
    pub async fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io(format!("read of {} failed", key)));
        }
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        if self.write_fails(key) {
            return Err(StoreError::Io(format!("quota exceeded writing {}", key)));
        }
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.write_fails(key) {
            return Err(StoreError::Io(format!("remove of {} failed", key)));
        }
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Key-value store persisting one file per key under a directory
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open the store, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        debug!("Opened key-value store at {}", dir.display());
        Ok(FileKeyValueStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let path = self.path_for(key);
        // Write then rename so readers never observe a partial file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

type Entries = Arc<TokioMutex<HashMap<String, MediaBlob>>>;

/// Named request/response caches held in memory
#[derive(Clone, Default)]
pub struct MemoryResponseCache {
    caches: Arc<TokioMutex<HashMap<String, Entries>>>,
    fail_puts: Arc<AtomicBool>,
    puts: Arc<AtomicUsize>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        MemoryResponseCache::default()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of successful puts across all caches
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn entry_count(&self, name: &str) -> usize {
        let entries = self.caches.lock().await.get(name).cloned();
        match entries {
            Some(entries) => entries.lock().await.len(),
            None => 0,
        }
    }
}

struct MemoryCacheHandle {
    name: String,
    entries: Entries,
    fail_puts: Arc<AtomicBool>,
    puts: Arc<AtomicUsize>,
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheHandle>, StoreError> {
        let entries = self
            .caches
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Arc::new(MemoryCacheHandle {
            name: name.to_string(),
            entries,
            fail_puts: self.fail_puts.clone(),
            puts: self.puts.clone(),
        }))
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self.caches.lock().await.remove(name).is_some();
        if existed {
            debug!("Deleted response cache {}", name);
        }
        Ok(existed)
    }
}

#[async_trait]
impl CacheHandle for MemoryCacheHandle {
    async fn put(&self, request: &str, response: MediaBlob) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            warn!("Rejecting put of {} into {}", request, self.name);
            return Err(StoreError::Io(format!("cache {} is full", self.name)));
        }
        self.entries.lock().await.insert(request.to_string(), response);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn match_request(&self, request: &str) -> Result<Option<MediaBlob>, StoreError> {
        Ok(self.entries.lock().await.get(request).cloned())
    }
}
