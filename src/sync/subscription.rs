// Reference-counted live subscription with fingerprint dedup and trailing debounce

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::fingerprint::chats_fingerprint;
use super::{ChatFeed, FeedEvent};
use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::models::Chat;
use crate::store::{messages_path, Document, ListenerRegistration, Query, RemoteStore, Snapshot, SortOrder};
use crate::wire::{chat_from_document, messages_from_documents};

/// The open remote listener plus the task pumping it
struct LiveSession {
    registration: ListenerRegistration,
    task: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

impl LiveSession {
    fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.registration.cancel();
        self.task.abort();
    }
}

#[derive(Default)]
struct ManagerState {
    tx: Option<broadcast::Sender<FeedEvent>>,
    observers: HashSet<u64>,
    next_observer_id: u64,
    session: Option<LiveSession>,
    /// Last dispatched event, replayed to observers that attach later
    latest: Option<FeedEvent>,
}

struct Inner {
    feed: ChatFeed,
    store: Arc<dyn RemoteStore>,
    throttle_window: Duration,
    page_size: usize,
    concurrency: usize,
    capacity: usize,
    state: Mutex<ManagerState>,
    dispatches: AtomicUsize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, observer_id: u64) {
        let mut state = self.lock();
        if !state.observers.remove(&observer_id) {
            return;
        }
        debug!(
            "Observer {} detached from {} ({} left)",
            observer_id,
            self.feed,
            state.observers.len()
        );
        if state.observers.is_empty() {
            if let Some(session) = state.session.take() {
                info!("Last observer left, closing live query for {}", self.feed);
                session.close();
            }
            state.tx = None;
            state.latest = None;
        }
    }
}

/// Keeps one live chat feed open for any number of observers.
///
/// The first `subscribe` opens the remote listener, the last detach closes it.
/// Snapshots are materialized (each chat with its newest page of messages),
/// dropped when their fingerprint matches the previously accepted one, and
/// delivered after a trailing debounce so only the last of a burst goes out.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn RemoteStore>, feed: ChatFeed, config: &SyncConfig) -> Self {
        SubscriptionManager {
            inner: Arc::new(Inner {
                feed,
                store,
                throttle_window: config.throttle_window(),
                page_size: config.messages_per_page.max(1),
                concurrency: config.materialize_concurrency.max(1),
                capacity: config.broadcast_capacity.max(1),
                state: Mutex::new(ManagerState::default()),
                dispatches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn feed(&self) -> &ChatFeed {
        &self.inner.feed
    }

    /// Attach an observer. Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// A handle that yields dispatched events; the last event dispatched before
    /// attaching is delivered first. Dropping the handle detaches it.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.inner.lock();
        let capacity = self.inner.capacity;
        let tx = state
            .tx
            .get_or_insert_with(|| broadcast::channel(capacity).0)
            .clone();
        let rx = tx.subscribe();

        state.next_observer_id += 1;
        let id = state.next_observer_id;
        state.observers.insert(id);
        let replay = state.latest.clone();

        if state.session.is_none() {
            info!("Opening live query for {}", self.inner.feed);
            state.session = Some(self.open_session());
        }
        debug!(
            "Observer {} attached to {} ({} total)",
            id,
            self.inner.feed,
            state.observers.len()
        );

        Subscription {
            inner: self.inner.clone(),
            id,
            rx,
            replay,
            attached: true,
        }
    }

    fn open_session(&self) -> LiveSession {
        let live = self.inner.store.listen(self.inner.feed.query());
        let closed = Arc::new(AtomicBool::new(false));
        let pump = Pump {
            inner: Arc::downgrade(&self.inner),
            store: self.inner.store.clone(),
            closed: closed.clone(),
            window: self.inner.throttle_window,
            page_size: self.inner.page_size,
            concurrency: self.inner.concurrency,
        };
        let task = tokio::spawn(pump.run(live.snapshots));

        LiveSession {
            registration: live.registration,
            task,
            closed,
        }
    }

    /// Close the remote listener and cancel any pending dispatch.
    /// Attached observers see the end of their stream.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if let Some(session) = state.session.take() {
            info!("Shutting down live query for {}", self.inner.feed);
            session.close();
        }
        state.observers.clear();
        state.tx = None;
        state.latest = None;
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Whether the underlying remote listener is open
    pub fn is_live(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Number of events delivered to observers so far
    pub fn dispatch_count(&self) -> usize {
        self.inner.dispatches.load(Ordering::SeqCst)
    }
}

/// Task state for one live session
struct Pump {
    inner: Weak<Inner>,
    store: Arc<dyn RemoteStore>,
    closed: Arc<AtomicBool>,
    window: Duration,
    page_size: usize,
    concurrency: usize,
}

impl Pump {
    async fn run(self, mut snapshots: mpsc::UnboundedReceiver<Snapshot>) {
        let mut last_fingerprint: Option<String> = None;
        let mut pending: Option<Arc<Vec<Chat>>> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                snapshot = snapshots.recv() => match snapshot {
                    Some(Ok(docs)) => {
                        let chats = match self.materialize(docs).await {
                            Ok(chats) => chats,
                            Err(e) => {
                                warn!("Failed to load messages for snapshot, skipping it: {}", e);
                                continue;
                            }
                        };
                        let fingerprint = chats_fingerprint(&chats);
                        if last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                            debug!("Snapshot unchanged ({}), skipping", &fingerprint[..12]);
                            continue;
                        }
                        debug!("Accepted snapshot of {} chats ({})", chats.len(), &fingerprint[..12]);
                        last_fingerprint = Some(fingerprint);
                        pending = Some(Arc::new(chats));
                        deadline = Some(Instant::now() + self.window);
                    }
                    Some(Err(e)) => {
                        error!("Live query failed: {}", e);
                        self.dispatch(FeedEvent::Unavailable(e.to_string()));
                        break;
                    }
                    None => {
                        debug!("Live query closed");
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if let Some(chats) = pending.take() {
                        self.dispatch(FeedEvent::Chats(chats));
                    }
                }
            }
        }
    }

    /// Attach the newest page of messages (ascending) to every chat in the snapshot
    async fn materialize(&self, docs: Vec<Document>) -> Result<Vec<Chat>, StoreError> {
        let chats: Vec<Chat> = docs
            .iter()
            .filter_map(|doc| match chat_from_document(doc) {
                Ok(chat) => Some(chat),
                Err(e) => {
                    warn!("Skipping malformed chat document: {}", e);
                    None
                }
            })
            .collect();

        let store = self.store.as_ref();
        let page_size = self.page_size;
        stream::iter(chats.into_iter().map(move |mut chat| async move {
            let query = Query::collection(&messages_path(&chat.id))
                .order_by("timestamp", SortOrder::Descending)
                .limit(page_size);
            let docs = store.query(&query).await?;
            let mut messages = messages_from_documents(&docs);
            messages.reverse();
            chat.messages = messages;
            Ok::<Chat, StoreError>(chat)
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await
    }

    fn dispatch(&self, event: FeedEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        // Checked under the lock: close() runs under the same lock
        if self.closed.load(Ordering::SeqCst) {
            debug!("Session closed, dropping dispatch");
            return;
        }
        inner.dispatches.fetch_add(1, Ordering::SeqCst);
        state.latest = Some(event.clone());
        if let Some(tx) = &state.tx {
            let receivers = tx.send(event).unwrap_or(0);
            debug!("Dispatched update for {} to {} observers", inner.feed, receivers);
        }
    }
}

/// One observer's attachment to a `SubscriptionManager`
pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
    rx: broadcast::Receiver<FeedEvent>,
    replay: Option<FeedEvent>,
    attached: bool,
}

impl Subscription {
    /// Next event, or `None` once the manager has shut down
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Only the newest state matters
                    warn!("Observer {} lagged, skipped {} updates", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Observer {} lagged, skipped {} updates", self.id, skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Detach explicitly. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.attached {
            self.attached = false;
            self.inner.release(self.id);
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = FeedEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
