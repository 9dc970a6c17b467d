// Identity-scoped local cache: structured chat data plus binary media
// Every failure in here is logged and treated as a miss

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::config::SyncConfig;
use crate::error::{CacheError, SyncError, SyncResult};
use crate::models::{merge_by_id, sort_messages, CacheEntry, Chat, Message};
use crate::store::{CacheHandle, KeyValueStore, MediaBlob, MediaBlobStore, ResponseCache};

pub mod prefetch;

pub use prefetch::{prefetch_images, PrefetchOutcome, PrefetchReport};

const CHAT_KEY_PREFIX: &str = "chatsync_chat_";
const MESSAGES_KEY_PREFIX: &str = "chatsync_messages_";

/// Cached message list, tagged with the chat it belongs to
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    chat_id: String,
    messages: Vec<Message>,
}

/// Check that a media URL is worth fetching: non-empty, http(s), with a host
pub fn validate_media_url(raw: &str) -> SyncResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::Validation("media URL is empty".to_string()));
    }
    let url = Url::parse(raw)
        .map_err(|e| SyncError::Validation(format!("malformed media URL {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SyncError::Validation(format!(
                "unsupported media URL scheme {}",
                other
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SyncError::Validation(format!("media URL {} has no host", raw)));
    }
    Ok(url)
}

/// Local cache for one phone-number identity.
///
/// Instances share the underlying storage but never each other's keys, so
/// `for_identity` can be used freely without mixing data between identities.
#[derive(Clone)]
pub struct CacheManager {
    identity: String,
    kv: Arc<dyn KeyValueStore>,
    media: Arc<dyn ResponseCache>,
    blobs: Arc<dyn MediaBlobStore>,
    max_cached_messages: usize,
    cache_version: String,
    prefetch_concurrency: usize,
}

impl CacheManager {
    pub fn new(
        identity: &str,
        kv: Arc<dyn KeyValueStore>,
        media: Arc<dyn ResponseCache>,
        blobs: Arc<dyn MediaBlobStore>,
        config: &SyncConfig,
    ) -> Self {
        CacheManager {
            identity: identity.to_string(),
            kv,
            media,
            blobs,
            max_cached_messages: config.max_cached_messages.max(1),
            cache_version: config.cache_version.clone(),
            prefetch_concurrency: config.prefetch_concurrency.max(1),
        }
    }

    /// Manager for another identity over the same storage
    pub fn for_identity(&self, identity: &str) -> CacheManager {
        CacheManager {
            identity: identity.to_string(),
            ..self.clone()
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn max_cached_messages(&self) -> usize {
        self.max_cached_messages
    }

    fn chat_key(&self) -> String {
        format!("{}{}", CHAT_KEY_PREFIX, self.identity)
    }

    fn messages_key(&self) -> String {
        format!("{}{}", MESSAGES_KEY_PREFIX, self.identity)
    }

    /// Name of this identity's media cache
    pub fn media_cache_name(&self) -> String {
        format!("{}_images_{}", self.cache_version, self.identity)
    }

    async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, CacheError> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write_entry<T: Serialize>(&self, key: &str, data: T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&CacheEntry::new(data))?;
        self.kv.set(key, raw).await?;
        Ok(())
    }

    /// Keep the newest `max_cached_messages`, ascending
    fn cap(&self, mut messages: Vec<Message>) -> Vec<Message> {
        sort_messages(&mut messages);
        if messages.len() > self.max_cached_messages {
            let excess = messages.len() - self.max_cached_messages;
            messages.drain(..excess);
        }
        messages
    }

    /// Persist chat metadata and, separately, its newest messages.
    ///
    /// If the message list cannot be written the metadata is removed again,
    /// so a reader never pairs it with a list left over from another write.
    pub async fn cache_chat(&self, chat: &Chat) {
        let list = MessageList {
            chat_id: chat.id.clone(),
            messages: self.cap(chat.messages.clone()),
        };
        let count = list.messages.len();

        if let Err(e) = self.write_entry(&self.chat_key(), chat.without_messages()).await {
            warn!("Failed to cache chat {} for {}: {}", chat.id, self.identity, e);
            return;
        }
        if let Err(e) = self.write_entry(&self.messages_key(), list).await {
            warn!("Failed to cache messages of {} for {}: {}", chat.id, self.identity, e);
            if let Err(e) = self.kv.remove(&self.chat_key()).await {
                warn!("Failed to drop chat metadata for {}: {}", self.identity, e);
            }
            return;
        }
        debug!("Cached chat {} with {} messages for {}", chat.id, count, self.identity);
    }

    /// Cached chat with its cached messages, or `None` on a miss
    pub async fn get_cached_chat(&self) -> Option<Chat> {
        self.get_cached_chat_entry().await.map(|entry| entry.data)
    }

    /// Like `get_cached_chat`, keeping the time the metadata was written
    pub async fn get_cached_chat_entry(&self) -> Option<CacheEntry<Chat>> {
        let mut entry = self.cached_metadata().await?;
        entry.data.messages = self.cached_messages(&entry.data.id).await;
        Some(entry)
    }

    async fn cached_metadata(&self) -> Option<CacheEntry<Chat>> {
        match self.read_entry(&self.chat_key()).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring unreadable chat cache for {}: {}", self.identity, e);
                None
            }
        }
    }

    /// Cached messages of `chat_id`; a list written for another chat reads as empty
    async fn cached_messages(&self, chat_id: &str) -> Vec<Message> {
        match self.read_entry::<MessageList>(&self.messages_key()).await {
            Ok(Some(entry)) if entry.data.chat_id == chat_id => entry.data.messages,
            Ok(Some(entry)) => {
                warn!(
                    "Cached messages for {} belong to chat {}, not {}",
                    self.identity, entry.data.chat_id, chat_id
                );
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Ignoring unreadable message cache for {}: {}", self.identity, e);
                Vec::new()
            }
        }
    }

    /// Merge a page of `chat_id`'s messages into the cache without duplicating ids,
    /// then prefetch media for the messages that were actually added.
    /// Nothing is merged unless `chat_id` is the chat currently cached.
    ///
    /// # Returns
    ///
    /// The number of new messages retained after capping
    pub async fn update_cached_messages(&self, chat_id: &str, new_messages: Vec<Message>) -> usize {
        match self.cached_metadata().await {
            Some(entry) if entry.data.id == chat_id => {}
            Some(entry) => {
                debug!(
                    "Cache for {} holds chat {}, not merging a page of {}",
                    self.identity, entry.data.id, chat_id
                );
                return 0;
            }
            None => {
                debug!("No cached chat for {}, not merging a page of {}", self.identity, chat_id);
                return 0;
            }
        }

        let mut merged = self.cached_messages(chat_id).await;
        let added = merge_by_id(&mut merged, new_messages);
        if added.is_empty() {
            debug!("No new messages to cache for {}", self.identity);
            return 0;
        }

        let merged = self.cap(merged);
        let retained: Vec<&Message> = added
            .iter()
            .filter(|m| merged.iter().any(|kept| kept.id == m.id))
            .collect();
        let urls: Vec<String> = retained
            .iter()
            .filter_map(|m| m.image_url().map(str::to_string))
            .collect();
        let retained = retained.len();

        let list = MessageList {
            chat_id: chat_id.to_string(),
            messages: merged,
        };
        if let Err(e) = self.write_entry(&self.messages_key(), list).await {
            warn!("Failed to update message cache for {}: {}", self.identity, e);
            return 0;
        }
        debug!("Merged {} new messages of {} into cache for {}", retained, chat_id, self.identity);

        prefetch_images(self, urls, self.prefetch_concurrency).await;
        retained
    }

    async fn open_media(&self) -> Result<Arc<dyn CacheHandle>, CacheError> {
        Ok(self.media.open(&self.media_cache_name()).await?)
    }

    /// Fetch and store one media URL. Never fails the caller.
    pub async fn cache_image(&self, url: &str) -> PrefetchOutcome {
        if let Err(e) = validate_media_url(url) {
            debug!("Skipping media cache for {:?}: {}", url, e);
            return PrefetchOutcome::Skipped;
        }

        let handle = match self.open_media().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Media cache unavailable for {}: {}", self.identity, e);
                return PrefetchOutcome::Failed;
            }
        };
        match handle.match_request(url).await {
            Ok(Some(_)) => return PrefetchOutcome::AlreadyCached,
            Ok(None) => {}
            Err(e) => warn!("Media cache lookup failed for {}: {}", url, e),
        }

        let blob = match self.blobs.get(url).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Failed to fetch {} for caching: {}", url, e);
                return PrefetchOutcome::Failed;
            }
        };
        match handle.put(url, blob).await {
            Ok(()) => {
                debug!("Cached media {}", url);
                PrefetchOutcome::Cached
            }
            Err(e) => {
                warn!("Failed to store {} in media cache: {}", url, e);
                PrefetchOutcome::Failed
            }
        }
    }

    pub async fn get_cached_image(&self, url: &str) -> Option<MediaBlob> {
        if validate_media_url(url).is_err() {
            return None;
        }
        let handle = match self.open_media().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Media cache unavailable for {}: {}", self.identity, e);
                return None;
            }
        };
        match handle.match_request(url).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Media cache lookup failed for {}: {}", url, e);
                None
            }
        }
    }

    /// Prefetch the avatar and every image preview of `chat`
    pub async fn prefetch_chat_media(&self, chat: &Chat) -> PrefetchReport {
        prefetch_images(self, chat.image_urls(), self.prefetch_concurrency).await
    }

    /// Remove this identity's structured and media cache. Safe to call repeatedly.
    pub async fn clear_cache(&self) {
        for key in [self.chat_key(), self.messages_key()] {
            if let Err(e) = self.kv.remove(&key).await {
                warn!("Failed to remove {}: {}", key, e);
            }
        }
        match self.media.delete(&self.media_cache_name()).await {
            Ok(existed) => debug!("Media cache {} removed (existed: {})", self.media_cache_name(), existed),
            Err(e) => warn!("Failed to remove media cache for {}: {}", self.identity, e),
        }
        info!("Cleared cache for {}", self.identity);
    }
}
