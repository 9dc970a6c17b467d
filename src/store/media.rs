// In-memory blob store addressed by URL

use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{MediaBlob, MediaBlobStore};
use crate::error::StoreError;

/// Base URL for objects served by the in-memory blob store
pub const MEDIA_BASE_URL: &str = "https://media.chatsync.local";

#[derive(Default)]
struct BlobState {
    objects: HashMap<String, MediaBlob>,
    fetches: HashMap<String, usize>,
    failing: HashSet<String>,
    offline: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<BlobState>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        MemoryBlobStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn url_for(key: &str) -> String {
        format!("{}/{}", MEDIA_BASE_URL, key.trim_start_matches('/'))
    }

    /// Serve `blob` at an arbitrary URL, as if hosted elsewhere
    pub fn insert_url(&self, url: &str, blob: MediaBlob) {
        self.lock().objects.insert(url.to_string(), blob);
    }

    /// Make every fetch of `url` fail
    pub fn fail_url(&self, url: &str) {
        self.lock().failing.insert(url.to_string());
    }

    /// Make every operation fail as if the network were down
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.lock().fetches.get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.lock().fetches.values().sum()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().objects.contains_key(&Self::url_for(key))
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }
}

#[async_trait]
impl MediaBlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError> {
        let mut state = self.lock();
        if state.offline {
            return Err(StoreError::Unavailable("blob store offline".to_string()));
        }
        let url = Self::url_for(key);
        debug!("Stored blob {} ({} bytes)", key, bytes.len());
        state.objects.insert(url.clone(), MediaBlob::new(bytes, content_type));
        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<MediaBlob, StoreError> {
        let mut state = self.lock();
        *state.fetches.entry(url.to_string()).or_insert(0) += 1;
        if state.offline || state.failing.contains(url) {
            return Err(StoreError::Unavailable(format!("fetch of {} failed", url)));
        }
        state
            .objects
            .get(url)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(url.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.offline {
            return Err(StoreError::Unavailable("blob store offline".to_string()));
        }
        let url = Self::url_for(key);
        match state.objects.remove(&url) {
            Some(_) => {
                debug!("Deleted blob {}", key);
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}
