//! In-process document store.
//!
//! `MemoryStore` implements [`RemoteStore`] over plain maps. It behaves like
//! a live remote store from the sync layer's point of view:
//! - `subscribe` delivers the current value immediately
//! - every successful write pushes a fresh full snapshot to each affected
//!   listener
//! - collection queries honour filters, ordering and limits
//!
//! It also exposes knobs for exercising failure paths: write latency,
//! injected write failures, denied collections, and forced listener errors.

use crate::error::{Result, SyncError};
use crate::store::{OnError, OnSnapshot, RemoteStore, Unsubscribe};
use crate::types::{
    CollectionPath, CollectionQuery, Direction, Document, DocumentId, DocumentRef, ErrorInfo,
    ErrorKind, Filter, FilterOp, MutationIntent, OrderBy, QueryRef, Snapshot,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

type Collection = BTreeMap<DocumentId, Map<String, Value>>;

struct Listener {
    query: QueryRef,
    on_snapshot: OnSnapshot,
    on_error: OnError,
}

#[derive(Default)]
struct Controls {
    write_delay: Duration,
    write_failure: Option<ErrorInfo>,
    denied: HashSet<CollectionPath>,
}

/// Call counters of a [`MemoryStore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub subscribe_calls: u64,
    pub unsubscribe_calls: u64,
    pub write_calls: u64,
    pub active_listeners: usize,
}

#[derive(Default)]
struct Inner {
    collections: RwLock<HashMap<CollectionPath, Collection>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    /// Serializes writes with snapshot delivery so every listener sees
    /// snapshots in write order.
    serial: Mutex<()>,
    controls: Mutex<Controls>,
    next_listener: AtomicU64,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl Inner {
    fn evaluate(&self, query: &QueryRef) -> Snapshot {
        let collections = self.collections.read();
        match query {
            QueryRef::Document(doc) => collections
                .get(&doc.collection)
                .and_then(|c| c.get(&doc.id))
                .map(|fields| {
                    Snapshot::Exists(Document::new(doc.id.as_str(), Value::Object(fields.clone())))
                })
                .unwrap_or(Snapshot::Absent),
            QueryRef::Collection(q) => {
                let docs = collections
                    .get(&q.collection)
                    .map(|c| run_query(c, q))
                    .unwrap_or_default();
                Snapshot::Collection(docs)
            }
        }
    }

    /// Listeners whose result may change after a write to `doc`.
    fn affected_by(&self, doc: &DocumentRef) -> Vec<(QueryRef, OnSnapshot)> {
        self.listeners
            .lock()
            .values()
            .filter(|l| match &l.query {
                QueryRef::Document(d) => d == doc,
                QueryRef::Collection(q) => q.collection == doc.collection,
            })
            .map(|l| (l.query.clone(), Arc::clone(&l.on_snapshot)))
            .collect()
    }

    /// Push fresh snapshots after a write. Caller holds `serial`.
    fn publish(&self, doc: &DocumentRef) {
        for (query, on_snapshot) in self.affected_by(doc) {
            let snapshot = self.evaluate(&query);
            on_snapshot(snapshot);
        }
    }

    fn apply(&self, intent: &MutationIntent) -> std::result::Result<DocumentRef, ErrorInfo> {
        let mut collections = self.collections.write();
        match intent {
            MutationIntent::Create {
                collection,
                payload,
            } => {
                let doc = collection.doc(DocumentId::generate());
                let fields = object(payload)?;
                collections
                    .entry(collection.clone())
                    .or_default()
                    .insert(doc.id.clone(), fields);
                Ok(doc)
            }
            MutationIntent::Set {
                document,
                payload,
                merge,
            } => {
                let fields = object(payload)?;
                let docs = collections.entry(document.collection.clone()).or_default();
                if *merge {
                    if let Some(existing) = docs.get_mut(&document.id) {
                        existing.extend(fields);
                        return Ok(document.clone());
                    }
                }
                docs.insert(document.id.clone(), fields);
                Ok(document.clone())
            }
            MutationIntent::Update { document, patch } => {
                let fields = object(patch)?;
                let existing = collections
                    .get_mut(&document.collection)
                    .and_then(|c| c.get_mut(&document.id))
                    .ok_or_else(|| {
                        ErrorInfo::new(
                            ErrorKind::NotFound,
                            format!("no document to update: {}", document.path()),
                        )
                    })?;
                existing.extend(fields);
                Ok(document.clone())
            }
            MutationIntent::Delete { document } => {
                if let Some(docs) = collections.get_mut(&document.collection) {
                    docs.remove(&document.id);
                }
                Ok(document.clone())
            }
        }
    }
}

/// An in-memory [`RemoteStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document directly, bypassing delay and failure injection.
    pub fn seed(&self, collection: &str, id: &str, fields: Value) -> Result<DocumentRef> {
        let document = DocumentRef::new(collection, id)?;
        let intent = MutationIntent::Set {
            document: document.clone(),
            payload: fields,
            merge: false,
        };

        let _serial = self.inner.serial.lock();
        self.inner
            .apply(&intent)
            .map_err(|e| SyncError::Serialization(e.message))?;
        self.inner.publish(&document);
        Ok(document)
    }

    /// Current body of a document.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        let doc = DocumentRef::new(collection, id).ok()?;
        self.inner
            .collections
            .read()
            .get(&doc.collection)
            .and_then(|c| c.get(&doc.id))
            .map(|fields| Value::Object(fields.clone()))
    }

    /// All documents of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        match QueryRef::collection(collection) {
            Ok(query) => match self.inner.evaluate(&query) {
                Snapshot::Collection(docs) => docs,
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    /// Delay every subsequent write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.controls.lock().write_delay = delay;
    }

    /// Make every subsequent write fail with `failure` (`None` to clear).
    pub fn fail_writes(&self, failure: Option<ErrorInfo>) {
        self.inner.controls.lock().write_failure = failure;
    }

    /// Refuse reads of and writes to `collection` with `PermissionDenied`.
    pub fn deny(&self, collection: &str) -> Result<()> {
        let path = CollectionPath::parse(collection)?;
        self.inner.controls.lock().denied.insert(path);
        Ok(())
    }

    /// Terminate every listener on `collection` with `error`.
    pub fn fail_listeners(&self, collection: &str, error: ErrorInfo) -> Result<()> {
        let path = CollectionPath::parse(collection)?;
        let failed: Vec<OnError> = {
            let mut listeners = self.inner.listeners.lock();
            let ids: Vec<u64> = listeners
                .iter()
                .filter(|(_, l)| l.query.collection_path() == &path)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| listeners.remove(id))
                .map(|l| l.on_error)
                .collect()
        };

        tracing::debug!(collection = %path, listeners = failed.len(), "failing listeners");
        for on_error in failed {
            on_error(error.clone());
        }
        Ok(())
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            subscribe_calls: self.inner.subscribe_calls.load(AtomicOrdering::SeqCst),
            unsubscribe_calls: self.inner.unsubscribe_calls.load(AtomicOrdering::SeqCst),
            write_calls: self.inner.write_calls.load(AtomicOrdering::SeqCst),
            active_listeners: self.inner.listeners.lock().len(),
        }
    }

    fn is_denied(&self, collection: &CollectionPath) -> bool {
        self.inner.controls.lock().denied.contains(collection)
    }
}

impl RemoteStore for MemoryStore {
    fn subscribe(
        &self,
        query: &QueryRef,
        on_snapshot: OnSnapshot,
        on_error: OnError,
    ) -> Unsubscribe {
        self.inner.subscribe_calls.fetch_add(1, AtomicOrdering::SeqCst);

        if self.is_denied(query.collection_path()) {
            on_error(ErrorInfo::new(
                ErrorKind::PermissionDenied,
                format!("missing permission to read {}", query.collection_path()),
            ));
            return self.unsubscribe_for(None);
        }

        let _serial = self.inner.serial.lock();
        let id = self.inner.next_listener.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner.listeners.lock().insert(
            id,
            Listener {
                query: query.clone(),
                on_snapshot: Arc::clone(&on_snapshot),
                on_error,
            },
        );

        let snapshot = self.inner.evaluate(query);
        on_snapshot(snapshot);

        self.unsubscribe_for(Some(id))
    }

    fn write(&self, intent: &MutationIntent) -> std::result::Result<(), ErrorInfo> {
        self.inner.write_calls.fetch_add(1, AtomicOrdering::SeqCst);

        let (delay, failure) = {
            let controls = self.inner.controls.lock();
            (controls.write_delay, controls.write_failure.clone())
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(failure) = failure {
            return Err(failure);
        }
        if self.is_denied(intent.collection()) {
            return Err(ErrorInfo::new(
                ErrorKind::PermissionDenied,
                format!("missing permission to write {}", intent.target()),
            ));
        }

        let _serial = self.inner.serial.lock();
        let document = self.inner.apply(intent)?;
        self.inner.publish(&document);
        Ok(())
    }
}

impl MemoryStore {
    fn unsubscribe_for(&self, listener: Option<u64>) -> Unsubscribe {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe_calls.fetch_add(1, AtomicOrdering::SeqCst);
                if let Some(id) = listener {
                    inner.listeners.lock().remove(&id);
                }
            }
        })
    }
}

fn object(value: &Value) -> std::result::Result<Map<String, Value>, ErrorInfo> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        other => Err(ErrorInfo::new(
            ErrorKind::InvalidArgument,
            format!("document body must be an object, got {}", other),
        )),
    }
}

fn run_query(collection: &Collection, query: &CollectionQuery) -> Vec<Document> {
    let mut docs: Vec<Document> = collection
        .iter()
        .filter(|(_, fields)| query.filters.iter().all(|f| matches(fields, f)))
        .filter(|(_, fields)| query.order_by.iter().all(|o| fields.contains_key(&o.field)))
        .map(|(id, fields)| Document::new(id.as_str(), Value::Object(fields.clone())))
        .collect();

    // Stable sort over id order, so ties stay ordered by id.
    if !query.order_by.is_empty() {
        docs.sort_by(|a, b| compare_docs(a, b, &query.order_by));
    }
    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }
    docs
}

fn matches(fields: &Map<String, Value>, filter: &Filter) -> bool {
    let Some(stored) = fields.get(&filter.field) else {
        return false;
    };
    match compare_same_type(stored, &filter.value.to_json()) {
        Some(ordering) => filter.op.accepts(ordering),
        None => filter.op == FilterOp::NotEqual,
    }
}

fn compare_docs(a: &Document, b: &Document, order_by: &[OrderBy]) -> Ordering {
    for clause in order_by {
        let ordering = match (a.get(&clause.field), b.get(&clause.field)) {
            (Some(x), Some(y)) => compare_total(x, y),
            _ => Ordering::Equal,
        };
        let ordering = match clause.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two scalars of the same type; `None` across types.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order across types, for sorting.
fn compare_total(a: &Value, b: &Value) -> Ordering {
    compare_same_type(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}
