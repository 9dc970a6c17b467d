// Common test utilities for integration tests
// Shared harness wiring the in-memory collaborators together
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use anyhow::{anyhow, Result};
use log::{info, LevelFilter};
use tokio::time::{timeout, Duration};

use chatsync::cache::CacheManager;
use chatsync::config::SyncConfig;
use chatsync::models::{Chat, Direction, Message, MessagePreview};
use chatsync::service::{ChatService, MessageService, StatusService, Uploader};
use chatsync::store::{
    Document, MediaBlob, MemoryBlobStore, MemoryKeyValueStore, MemoryRemoteStore,
    MemoryResponseCache, Patch, RemoteStore, CHATS,
};
use chatsync::sync::{ChatFeed, FeedEvent, Subscription, SubscriptionManager};
use chatsync::view::{ChatViewModel, ChatViewState};
use chatsync::wire::chat_from_document;

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Every collaborator plus the services built on top of them
pub struct Harness {
    pub config: SyncConfig,
    pub remote: MemoryRemoteStore,
    pub blobs: MemoryBlobStore,
    pub kv: MemoryKeyValueStore,
    pub media: MemoryResponseCache,
    pub messages: MessageService,
    pub chats: ChatService,
    pub statuses: StatusService,
    pub uploader: Uploader,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig {
            throttle_window_ms: 1000,
            ..SyncConfig::default()
        })
    }

    pub fn with_config(config: SyncConfig) -> Self {
        setup_logging();
        let remote = MemoryRemoteStore::new();
        let blobs = MemoryBlobStore::new();
        let messages = MessageService::new(Arc::new(remote.clone()), &config);
        let chats = ChatService::new(Arc::new(remote.clone()), messages.clone(), &config);
        let statuses = StatusService::new(Arc::new(remote.clone()), Arc::new(blobs.clone()), &config);
        let uploader = Uploader::new(Arc::new(blobs.clone()), &config);

        Harness {
            config,
            remote,
            blobs,
            kv: MemoryKeyValueStore::new(),
            media: MemoryResponseCache::new(),
            messages,
            chats,
            statuses,
            uploader,
        }
    }

    pub fn cache(&self, identity: &str) -> CacheManager {
        CacheManager::new(
            identity,
            Arc::new(self.kv.clone()),
            Arc::new(self.media.clone()),
            Arc::new(self.blobs.clone()),
            &self.config,
        )
    }

    pub fn manager(&self, feed: ChatFeed) -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(self.remote.clone()), feed, &self.config)
    }

    pub fn view(&self, feed: ChatFeed, identity: &str, direction: Direction) -> ChatViewModel {
        ChatViewModel::new(
            self.manager(feed),
            self.cache(identity),
            self.messages.clone(),
            direction,
        )
    }

    /// Chat record with no messages and a zero unread counter
    pub async fn seed_empty_chat(&self, chat_id: &str, phone: &str) -> Result<()> {
        self.remote
            .set(
                CHATS,
                chat_id,
                Patch::new()
                    .set("phoneNumber", phone)
                    .set("name", phone)
                    .set("lastMessage", "")
                    .set("unreadCount", 0),
            )
            .await?;
        Ok(())
    }

    /// Seed a chat and `count` alternating text messages "msg 1".."msg N"
    pub async fn seed_chat_with_messages(&self, chat_id: &str, phone: &str, count: usize) -> Result<Vec<Message>> {
        self.seed_empty_chat(chat_id, phone).await?;
        let mut sent = Vec::new();
        for n in 1..=count {
            let direction = if n % 2 == 0 { Direction::Outgoing } else { Direction::Incoming };
            let message = self
                .messages
                .send(chat_id, &format!("msg {}", n), None, direction)
                .await?
                .message;
            sent.push(message);
        }
        Ok(sent)
    }

    /// Current chat metadata as stored remotely
    pub async fn stored_chat(&self, chat_id: &str) -> Result<Chat> {
        let doc: Document = self
            .remote
            .get(CHATS, chat_id)
            .await?
            .ok_or_else(|| anyhow!("chat {} missing", chat_id))?;
        Ok(chat_from_document(&doc)?)
    }

    /// Host an image at `url` in the blob store
    pub fn host_image(&self, url: &str) {
        self.blobs.insert_url(url, MediaBlob::new(vec![0x89, b'P', b'N', b'G'], "image/png"));
    }
}

pub fn image_preview(url: &str) -> MessagePreview {
    MessagePreview::image(url, "photo.png")
}

/// Wait for the next event matching `predicate`
pub async fn wait_for_event(
    subscription: &mut Subscription,
    predicate: impl Fn(&FeedEvent) -> bool,
    timeout_secs: u64,
) -> Result<FeedEvent> {
    info!("Waiting for feed event...");
    match timeout(Duration::from_secs(timeout_secs), async {
        while let Some(event) = subscription.recv().await {
            if predicate(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("Subscription closed"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Timed out waiting for feed event")),
    }
}

/// Wait until the view state satisfies `predicate`
pub async fn wait_for_state(
    view: &ChatViewModel,
    predicate: impl Fn(&ChatViewState) -> bool,
    timeout_secs: u64,
) -> Result<ChatViewState> {
    let mut rx = view.watch();
    let state = timeout(Duration::from_secs(timeout_secs), rx.wait_for(|state| predicate(state)))
        .await
        .map_err(|_| anyhow!("Timed out waiting for view state"))??
        .clone();
    Ok(state)
}
