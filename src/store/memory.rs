// In-memory remote document store with live queries
// Used by the demo binary and as the remote collaborator in tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Document, FieldValue, Fields, ListenerRegistration, LiveQuery, Patch, Query, RemoteStore,
    Snapshot, SortOrder,
};
use crate::error::StoreError;
use crate::wire::{normalize_timestamp, timestamp_to_value};

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Query,
    Add,
    Set,
    Update,
    Delete,
    Listen,
}

struct Listener {
    id: u64,
    query: Query,
    tx: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
    last_server_time: Option<DateTime<Utc>>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    listeners_opened: usize,
    listeners_closed: usize,
    operations: usize,
}

impl State {
    /// Server clock: never repeats and never goes backwards
    fn server_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_server_time {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_server_time = Some(next);
        next
    }

    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        self.operations += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!("Injected failure for {:?}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn apply(&mut self, base: Fields, patch: Patch) -> Fields {
        let mut fields = base;
        for (key, value) in patch.entries().iter().cloned() {
            let resolved = match value {
                FieldValue::Set(value) => value,
                FieldValue::ServerTimestamp => timestamp_to_value(&self.server_time()),
                FieldValue::Increment(by) => {
                    let current = fields.get(&key).and_then(Value::as_i64).unwrap_or(0);
                    Value::from(current + by)
                }
            };
            fields.insert(key, resolved);
        }
        fields
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let Some(collection) = self.collections.get(&query.collection) else {
            return Vec::new();
        };

        let mut docs: Vec<Document> = collection
            .iter()
            .filter(|(_, fields)| {
                query
                    .filters
                    .iter()
                    .all(|(field, expected)| fields.get(field) == Some(expected))
            })
            .map(|(id, fields)| Document::new(id, fields.clone()))
            .collect();

        match &query.order_by {
            Some((field, order)) => {
                docs.sort_by(|a, b| compare_docs(a, b, field, *order));
                if let Some(cursor) = &query.start_after {
                    docs.retain(|doc| compare_docs(doc, cursor, field, *order) == Ordering::Greater);
                }
            }
            None => {
                if let Some(cursor) = &query.start_after {
                    docs.retain(|doc| doc.id > cursor.id);
                }
            }
        }

        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        docs
    }

    fn notify(&mut self, collection: &str) {
        let mut snapshots = Vec::new();
        for listener in self.listeners.iter().filter(|l| l.query.collection == collection) {
            snapshots.push((listener.id, self.run_query(&listener.query)));
        }
        for (id, docs) in snapshots {
            if let Some(listener) = self.listeners.iter().find(|l| l.id == id) {
                if listener.tx.send(Ok(docs)).is_err() {
                    debug!("Live query {} receiver dropped", id);
                }
            }
        }
    }
}

/// Ordering value of a field. Missing fields sort first.
#[derive(Debug, PartialEq)]
enum SortKey {
    Missing,
    Number(f64),
    Time(DateTime<Utc>),
    Text(String),
}

impl SortKey {
    fn of(value: Option<&Value>) -> SortKey {
        match value {
            None | Some(Value::Null) => SortKey::Missing,
            Some(Value::Bool(b)) => SortKey::Number(if *b { 1.0 } else { 0.0 }),
            Some(Value::Number(n)) => SortKey::Number(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(s)) => SortKey::Text(s.clone()),
            Some(other) => match normalize_timestamp(other) {
                Some(time) => SortKey::Time(time),
                None => SortKey::Missing,
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Missing => 0,
            SortKey::Number(_) => 1,
            SortKey::Time(_) => 2,
            SortKey::Text(_) => 3,
        }
    }

    fn compare(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Time(a), SortKey::Time(b)) => a.cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn compare_docs(a: &Document, b: &Document, field: &str, order: SortOrder) -> Ordering {
    let ordering = SortKey::of(a.get(field))
        .compare(&SortKey::of(b.get(field)))
        .then_with(|| a.id.cmp(&b.id));
    match order {
        SortOrder::Ascending => ordering,
        SortOrder::Descending => ordering.reverse(),
    }
}

/// Remote store kept entirely in process memory
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<State>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        MemoryRemoteStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn simulate_latency(&self) {
        let latency = match self.latency.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Delay every async operation by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        match self.latency.lock() {
            Ok(mut guard) => *guard = latency,
            Err(poisoned) => *poisoned.into_inner() = latency,
        }
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Terminate every active live query with `err`
    pub fn fail_listeners(&self, err: StoreError) {
        let mut state = self.lock();
        for listener in state.listeners.drain(..) {
            warn!("Failing live query {} on {}", listener.id, listener.query.collection);
            let _ = listener.tx.send(Err(err.clone()));
        }
    }

    pub fn listeners_opened(&self) -> usize {
        self.lock().listeners_opened
    }

    pub fn listeners_closed(&self) -> usize {
        self.lock().listeners_closed
    }

    pub fn active_listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of store calls issued so far, including failed ones
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    fn write(&self, collection: &str, id: &str, fields: Fields) -> Document {
        let mut state = self.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields.clone());
        state.notify(collection);
        Document::new(id, fields)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.take_failure(StoreOp::Get)?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.take_failure(StoreOp::Query)?;
        Ok(state.run_query(query))
    }

    async fn add(&self, collection: &str, patch: Patch) -> Result<Document, StoreError> {
        self.simulate_latency().await;
        let fields = {
            let mut state = self.lock();
            state.take_failure(StoreOp::Add)?;
            state.apply(Fields::new(), patch)
        };
        let id = Uuid::new_v4().simple().to_string();
        debug!("Adding document {}/{}", collection, id);
        Ok(self.write(collection, &id, fields))
    }

    async fn set(&self, collection: &str, id: &str, patch: Patch) -> Result<Document, StoreError> {
        self.simulate_latency().await;
        let fields = {
            let mut state = self.lock();
            state.take_failure(StoreOp::Set)?;
            state.apply(Fields::new(), patch)
        };
        debug!("Setting document {}/{}", collection, id);
        Ok(self.write(collection, id, fields))
    }

    async fn update(&self, collection: &str, id: &str, patch: Patch) -> Result<Document, StoreError> {
        self.simulate_latency().await;
        let fields = {
            let mut state = self.lock();
            state.take_failure(StoreOp::Update)?;
            let existing = state
                .collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))?;
            state.apply(existing, patch)
        };
        debug!("Updating document {}/{}", collection, id);
        Ok(self.write(collection, id, fields))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.take_failure(StoreOp::Delete)?;
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            debug!("Deleted document {}/{}", collection, id);
            state.notify(collection);
        }
        Ok(())
    }

    fn listen(&self, query: Query) -> LiveQuery {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.listeners_opened += 1;
        state.next_listener_id += 1;
        let id = state.next_listener_id;

        match state.take_failure(StoreOp::Listen) {
            Err(err) => {
                let _ = tx.send(Err(err));
            }
            Ok(()) => {
                let initial = state.run_query(&query);
                let _ = tx.send(Ok(initial));
                debug!("Opened live query {} on {}", id, query.collection);
                state.listeners.push(Listener { id, query, tx });
            }
        }
        drop(state);

        let shared = self.state.clone();
        let registration = ListenerRegistration::new(move || {
            let mut state = match shared.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.listeners.retain(|listener| listener.id != id);
            state.listeners_closed += 1;
            debug!("Closed live query {}", id);
        });

        LiveQuery {
            snapshots: rx,
            registration,
        }
    }
}
