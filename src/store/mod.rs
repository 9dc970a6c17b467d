// External collaborator interfaces: remote document store, blob store, local storage
// In-memory implementations live in the submodules and back both the demo and the tests

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::StoreError;

pub mod local;
pub mod media;
pub mod memory;

pub use local::{FileKeyValueStore, MemoryKeyValueStore, MemoryResponseCache};
pub use media::MemoryBlobStore;
pub use memory::{MemoryRemoteStore, StoreOp};

/// Plain key/value record body
pub type Fields = serde_json::Map<String, Value>;

/// Collection holding chat metadata records
pub const CHATS: &str = "chats";

/// Collection holding the admin's status posts
pub const STATUSES: &str = "admin/profile/statuses";

/// Collection holding the messages of one chat
pub fn messages_path(chat_id: &str) -> String {
    format!("{}/{}/messages", CHATS, chat_id)
}

/// A record read from the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: &str, fields: Fields) -> Self {
        Document {
            id: id.to_string(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// How a single field of a write is resolved
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Store the value as given
    Set(Value),
    /// Replace with the server's clock at commit time
    ServerTimestamp,
    /// Add to the current numeric value (missing counts as zero)
    Increment(i64),
}

/// Ordered set of field writes applied by `add`, `set` and `update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    entries: Vec<(String, FieldValue)>,
}

impl Patch {
    pub fn new() -> Self {
        Patch::default()
    }

    pub fn from_fields(fields: Fields) -> Self {
        fields
            .into_iter()
            .fold(Patch::new(), |patch, (key, value)| patch.set(&key, value))
    }

    pub fn set(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, FieldValue::Set(value.into()))
    }

    pub fn server_timestamp(self, field: &str) -> Self {
        self.with(field, FieldValue::ServerTimestamp)
    }

    pub fn increment(self, field: &str, by: i64) -> Self {
        self.with(field, FieldValue::Increment(by))
    }

    fn with(mut self, field: &str, value: FieldValue) -> Self {
        match self.entries.iter_mut().find(|(key, _)| key == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field.to_string(), value)),
        }
        self
    }

    pub fn entries(&self) -> &[(String, FieldValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.entries.iter().any(|(key, _)| key == field)
    }

    fn entry(&self, field: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == field)
            .map(|(_, value)| value)
    }

    /// Literal value written to `field`, if it is a plain set
    pub fn value_of(&self, field: &str) -> Option<&Value> {
        match self.entry(field) {
            Some(FieldValue::Set(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_server_timestamp(&self, field: &str) -> bool {
        matches!(self.entry(field), Some(FieldValue::ServerTimestamp))
    }

    pub fn increment_of(&self, field: &str) -> Option<i64> {
        match self.entry(field) {
            Some(FieldValue::Increment(by)) => Some(*by),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Collection query: equality filters, one ordering, cursor and limit
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, SortOrder)>,
    pub start_after: Option<Document>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(path: &str) -> Self {
        Query {
            collection: path.to_string(),
            filters: Vec::new(),
            order_by: None,
            start_after: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, order: SortOrder) -> Self {
        self.order_by = Some((field.to_string(), order));
        self
    }

    /// Resume after the given document in the query's ordering
    pub fn start_after(mut self, cursor: Document) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// One delivery of a live query: the full ordered result set, or the error that ended it
pub type Snapshot = Result<Vec<Document>, StoreError>;

/// Handle for a live query. Cancelling stops deliveries; dropping cancels.
pub struct ListenerRegistration {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ListenerRegistration {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        ListenerRegistration {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Stop the listener. Only the first call has an effect.
    pub fn cancel(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            debug!("Cancelling live query listener");
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Live query: an initial snapshot followed by one snapshot per change
pub struct LiveQuery {
    pub snapshots: mpsc::UnboundedReceiver<Snapshot>,
    pub registration: ListenerRegistration,
}

/// Ordered, queryable document store with live change notification
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Create a document with a store-assigned id
    async fn add(&self, collection: &str, patch: Patch) -> Result<Document, StoreError>;

    /// Create or overwrite the document with the given id
    async fn set(&self, collection: &str, id: &str, patch: Patch) -> Result<Document, StoreError>;

    /// Apply a patch to an existing document. Fails with `NotFound` if it does not exist.
    async fn update(&self, collection: &str, id: &str, patch: Patch) -> Result<Document, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Open a live query. Never blocks; failures arrive as an `Err` snapshot.
    fn listen(&self, query: Query) -> LiveQuery;
}

/// Binary payload plus its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl MediaBlob {
    pub fn new(bytes: Vec<u8>, content_type: &str) -> Self {
        MediaBlob {
            bytes,
            content_type: content_type.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Binary storage reachable by URL
#[async_trait]
pub trait MediaBlobStore: Send + Sync {
    /// Store bytes under `key`, returning the public URL
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError>;

    async fn get(&self, url: &str) -> Result<MediaBlob, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Durable string key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Named request/response caches
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheHandle>, StoreError>;

    /// Drop a whole named cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CacheHandle: Send + Sync {
    async fn put(&self, request: &str, response: MediaBlob) -> Result<(), StoreError>;

    async fn match_request(&self, request: &str) -> Result<Option<MediaBlob>, StoreError>;
}
