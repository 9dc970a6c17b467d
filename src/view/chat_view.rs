// Merges the cached chat, live snapshots and optimistic sends into one view state

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ChatViewState;
use crate::cache::{CacheManager, PrefetchReport};
use crate::error::{SyncError, SyncResult};
use crate::models::{search_messages, Chat, Direction, Message, MessagePreview};
use crate::service::{MessageService, SentMessage};
use crate::sync::{chat_fingerprint, FeedEvent, Subscription, SubscriptionManager};

#[derive(Default)]
struct Selection {
    chat_id: Option<String>,
    /// Fingerprint of the last snapshot rendered for the selected chat
    rendered: Option<String>,
    /// Latest chat list from the feed, used when the selection changes
    latest: Option<Arc<Vec<Chat>>>,
}

struct ViewInner {
    manager: SubscriptionManager,
    cache: CacheManager,
    messages: MessageService,
    direction: Direction,
    state: watch::Sender<ChatViewState>,
    selection: Mutex<Selection>,
    /// Bumped on mount and unmount; work started under an older value is discarded
    generation: AtomicU64,
    renders: AtomicUsize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewInner {
    fn selection(&self) -> MutexGuard<'_, Selection> {
        match self.selection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn selected_id(&self) -> Option<String> {
        self.selection().chat_id.clone()
    }

    /// Pick the selected chat out of a list, selecting the first one if nothing is selected yet
    fn pick(&self, chats: &Arc<Vec<Chat>>) -> Option<(Chat, bool)> {
        let mut selection = self.selection();
        selection.latest = Some(chats.clone());

        let chat = match &selection.chat_id {
            Some(id) => chats.iter().find(|chat| &chat.id == id)?.clone(),
            None => {
                let first = chats.first()?.clone();
                selection.chat_id = Some(first.id.clone());
                first
            }
        };

        let fingerprint = chat_fingerprint(&chat);
        let unchanged = selection.rendered.as_deref() == Some(fingerprint.as_str());
        selection.rendered = Some(fingerprint);
        Some((chat, unchanged))
    }

    async fn apply(&self, event: FeedEvent, generation: u64) {
        let chats = match event {
            FeedEvent::Chats(chats) => chats,
            FeedEvent::Unavailable(reason) => {
                warn!("Live feed unavailable for {}: {}", self.cache.identity(), reason);
                self.state.send_modify(|state| state.unavailable = Some(reason));
                return;
            }
        };

        let Some((chat, unchanged)) = self.pick(&chats) else {
            debug!("Selected chat not in snapshot, keeping current view");
            return;
        };
        let initialized = self.state.borrow().initialized;
        if unchanged && initialized {
            debug!("Chat {} unchanged, skipping render", chat.id);
            return;
        }

        self.cache.cache_chat(&chat).await;

        let mut report = None;
        if !initialized {
            report = Some(self.cache.prefetch_chat_media(&chat).await);
        }
        if !self.is_current(generation) {
            debug!("View unmounted while applying snapshot, discarding");
            return;
        }

        self.render(chat, report);
    }

    fn render(&self, snapshot: Chat, report: Option<PrefetchReport>) {
        self.state.send_modify(|state| {
            let mut chat = snapshot;
            let mut known = HashSet::new();
            // Keep older pages loaded earlier; messages are never deleted
            if let Some(previous) = state.chat.take().filter(|prev| prev.id == chat.id) {
                known.extend(previous.messages.iter().map(|m| m.id.clone()));
                chat.merge_messages(previous.messages);
            }
            let arrived: Vec<&Message> = chat.messages.iter().filter(|m| !known.contains(&m.id)).collect();
            drop_confirmed(&mut state.pending, &arrived);
            if chat.reconcile_summary() {
                debug!("Summary of chat {} was stale, using derived value", chat.id);
            }
            state.chat = Some(chat);
            state.from_cache = false;
            state.unavailable = None;
            if let Some(report) = report {
                state.prefetch = Some(report);
            }
            state.initialized = true;
        });
        self.renders.fetch_add(1, Ordering::SeqCst);
    }
}

/// View model for one consumer.
///
/// Paints from the cache on mount, then follows the live feed. The selected
/// chat is tracked by id so changes elsewhere in the list never move it.
pub struct ChatViewModel {
    inner: Arc<ViewInner>,
}

impl ChatViewModel {
    /// # Arguments
    ///
    /// * `direction` - How messages sent from this view are attributed
    pub fn new(
        manager: SubscriptionManager,
        cache: CacheManager,
        messages: MessageService,
        direction: Direction,
    ) -> Self {
        let (state, _) = watch::channel(ChatViewState::default());
        ChatViewModel {
            inner: Arc::new(ViewInner {
                manager,
                cache,
                messages,
                direction,
                state,
                selection: Mutex::new(Selection::default()),
                generation: AtomicU64::new(0),
                renders: AtomicUsize::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Paint from the cache, then attach to the live feed.
    /// Mounting an already mounted view remounts it.
    pub async fn mount(&self) {
        self.unmount();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(cached) = self.inner.cache.get_cached_chat().await {
            if !self.inner.is_current(generation) {
                return;
            }
            let selected = self.inner.selected_id();
            if selected.is_none() || selected.as_deref() == Some(cached.id.as_str()) {
                debug!("Painting chat {} from cache", cached.id);
                self.inner.selection().chat_id.get_or_insert_with(|| cached.id.clone());
                self.inner.state.send_modify(|state| {
                    if state.chat.is_none() {
                        state.chat = Some(cached);
                        state.from_cache = true;
                    }
                });
            }
        }

        let subscription = self.inner.manager.subscribe();
        let inner = self.inner.clone();
        let task = tokio::spawn(Self::follow(inner, subscription, generation));
        match self.inner.task.lock() {
            Ok(mut guard) => *guard = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }
        info!("Mounted chat view for {}", self.inner.cache.identity());
    }

    async fn follow(inner: Arc<ViewInner>, mut subscription: Subscription, generation: u64) {
        while let Some(event) = subscription.recv().await {
            if !inner.is_current(generation) {
                break;
            }
            inner.apply(event, generation).await;
        }
        debug!("Chat view stopped following the feed");
    }

    /// Detach from the feed. In-flight work finishes but its results are discarded.
    pub fn unmount(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let task = match self.inner.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            debug!("Unmounted chat view for {}", self.inner.cache.identity());
        }
    }

    /// Select a chat by id. Takes effect immediately if the chat is in the latest
    /// snapshot, which then also replaces this identity's cached chat.
    pub async fn select(&self, chat_id: &str) {
        let latest = {
            let mut selection = self.inner.selection();
            if selection.chat_id.as_deref() == Some(chat_id) {
                return;
            }
            selection.chat_id = Some(chat_id.to_string());
            selection.rendered = None;
            selection.latest.clone()
        };

        self.inner.state.send_modify(|state| {
            state.pending.clear();
            state.chat = None;
            state.from_cache = false;
        });
        let Some((chat, _)) = latest.and_then(|chats| self.inner.pick(&chats)) else {
            return;
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.cache.cache_chat(&chat).await;
        if self.inner.is_current(generation) && self.inner.selected_id().as_deref() == Some(chat.id.as_str()) {
            self.inner.render(chat, None);
        }
    }

    pub fn selected_chat_id(&self) -> Option<String> {
        self.inner.selected_id()
    }

    /// Send from this view. The message shows up as pending right away and is
    /// removed again if the send fails.
    pub async fn send(&self, content: &str, preview: Option<MessagePreview>) -> SyncResult<SentMessage> {
        let chat_id = self
            .inner
            .selected_id()
            .ok_or_else(|| SyncError::Validation("no chat selected".to_string()))?;

        let mut optimistic = Message::draft(content, preview.clone(), self.inner.direction);
        if !optimistic.is_well_formed() {
            return Err(SyncError::Validation(
                "message needs text content or a preview".to_string(),
            ));
        }
        let local_id = format!("local-{}", Uuid::new_v4().simple());
        optimistic.id = local_id.clone();
        self.inner
            .state
            .send_modify(|state| state.pending.push(optimistic));

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let result = self
            .inner
            .messages
            .send(&chat_id, content, preview, self.inner.direction)
            .await;

        // Always leave pending; a remounted view picks the message up from the feed
        let current = self.inner.is_current(generation);
        self.inner.state.send_modify(|state| {
            state.pending.retain(|message| message.id != local_id);
            if !current {
                return;
            }
            if let (Ok(sent), Some(chat)) = (&result, state.chat.as_mut()) {
                if chat.id == chat_id {
                    chat.merge_messages(vec![sent.message.clone()]);
                    chat.reconcile_summary();
                }
            }
        });
        if let Err(e) = &result {
            warn!("Send to chat {} failed: {}", chat_id, e);
        }
        result
    }

    /// Load the page before the oldest message shown and merge it into view and cache.
    ///
    /// # Returns
    ///
    /// The number of messages added to the view
    pub async fn load_older(&self) -> SyncResult<usize> {
        let Some((chat_id, oldest)) = self.inner.state.borrow().chat.as_ref().and_then(|chat| {
            chat.messages
                .first()
                .map(|message| (chat.id.clone(), message.id.clone()))
        }) else {
            return Ok(0);
        };

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let page_size = self.inner.messages.page_size();
        let older = self
            .inner
            .messages
            .load_older_messages(&chat_id, &oldest, page_size)
            .await?;
        if !self.inner.is_current(generation) {
            debug!("View unmounted during pagination, discarding {} messages", older.len());
            return Ok(0);
        }

        self.inner.cache.update_cached_messages(&chat_id, older.clone()).await;
        if !self.inner.is_current(generation) {
            return Ok(0);
        }

        let mut added = 0;
        self.inner.state.send_modify(|state| {
            if let Some(chat) = state.chat.as_mut().filter(|chat| chat.id == chat_id) {
                added = chat.merge_messages(older).len();
            }
        });
        Ok(added)
    }

    /// Mark the selected chat as read, remotely and in the view
    pub async fn mark_read(&self) -> SyncResult<usize> {
        let chat_id = self
            .inner
            .selected_id()
            .ok_or_else(|| SyncError::Validation("no chat selected".to_string()))?;
        let marked = self.inner.messages.mark_as_read(&chat_id).await?;
        self.inner.state.send_modify(|state| {
            if let Some(chat) = state.chat.as_mut().filter(|chat| chat.id == chat_id) {
                chat.unread_count = 0;
            }
        });
        Ok(marked)
    }

    /// Messages in view whose content contains `term`, ignoring case
    pub fn search(&self, term: &str) -> Vec<Message> {
        let messages = self.inner.state.borrow().messages();
        search_messages(&messages, term).into_iter().cloned().collect()
    }

    pub fn state(&self) -> ChatViewState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<ChatViewState> {
        self.inner.state.subscribe()
    }

    /// Number of live snapshots rendered so far
    pub fn render_count(&self) -> usize {
        self.inner.renders.load(Ordering::SeqCst)
    }

    /// Log out: detach and wipe this identity's local cache
    pub async fn clear(&self) {
        self.unmount();
        self.inner.cache.clear_cache().await;
        self.inner.state.send_modify(|state| *state = ChatViewState::default());
        *self.inner.selection() = Selection::default();
    }
}

/// Remove pending sends whose server copy is among `arrived`, one per copy
fn drop_confirmed(pending: &mut Vec<Message>, arrived: &[&Message]) {
    for message in arrived {
        let echo = pending.iter().position(|p| {
            p.direction == message.direction && p.content == message.content && p.preview == message.preview
        });
        if let Some(index) = echo {
            debug!("Server copy {} arrived for pending {}", message.id, pending[index].id);
            pending.remove(index);
        }
    }
}

impl Drop for ChatViewModel {
    fn drop(&mut self) {
        self.unmount();
    }
}
