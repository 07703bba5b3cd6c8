//! Core types for the sync layer.

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Slash-separated path to a collection, e.g. `products` or
/// `users/u1/orders`. Always an odd number of non-empty segments.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parse and normalize a collection path. Leading and trailing
    /// slashes are ignored.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(SyncError::InvalidPath("empty collection path".into()));
        }

        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(SyncError::InvalidPath(format!(
                "empty segment in collection path '{}'",
                path
            )));
        }
        if segments.len() % 2 == 0 {
            return Err(SyncError::InvalidPath(format!(
                "'{}' names a document, not a collection",
                path
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reference to a document inside this collection.
    pub fn doc(&self, id: DocumentId) -> DocumentRef {
        DocumentRef {
            collection: self.clone(),
            id,
        }
    }
}

impl fmt::Debug for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collection({})", self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a document within its collection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Length of generated ids.
    pub const GENERATED_LEN: usize = 20;

    pub fn parse(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(SyncError::InvalidPath("empty document id".into()));
        }
        if id.contains('/') {
            return Err(SyncError::InvalidPath(format!(
                "document id '{}' contains '/'",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Generate a fresh client-side id.
    ///
    /// Ids are unique within a process and collision-resistant across
    /// processes (wall clock, process id and a counter, hashed).
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let count = COUNTER.fetch_add(1, AtomicOrdering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(count.to_le_bytes());
        let digest = hasher.finalize();

        Self(hex::encode(&digest[..Self::GENERATED_LEN / 2]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a single document.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: CollectionPath,
    pub id: DocumentId,
}

impl DocumentRef {
    pub fn new(collection: &str, id: &str) -> Result<Self> {
        Ok(Self {
            collection: CollectionPath::parse(collection)?,
            id: DocumentId::parse(id)?,
        })
    }

    /// Full slash-separated path of the document.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Scalar value used in filters.
///
/// Restricted to types with total equality so that filters can take part
/// in query identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(i64::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Comparison operator of a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl FilterOp {
    /// Whether `stored <op> operand` holds, given `stored.cmp(operand)`.
    pub fn accepts(self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Equal => ordering == Ordering::Equal,
            FilterOp::NotEqual => ordering != Ordering::Equal,
            FilterOp::Less => ordering == Ordering::Less,
            FilterOp::LessOrEqual => ordering != Ordering::Greater,
            FilterOp::Greater => ordering == Ordering::Greater,
            FilterOp::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

/// A `field <op> value` condition on collection documents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, FilterOp::Equal, value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One ordering clause of a collection query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// A (possibly filtered and ordered) query over one collection.
///
/// Filters are kept sorted; ordering clauses keep the order given.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionQuery {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

/// Structurally-identified reference to a document or a collection query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryRef {
    Document(DocumentRef),
    Collection(CollectionQuery),
}

impl QueryRef {
    /// Unfiltered query over a whole collection.
    pub fn collection(path: &str) -> Result<Self> {
        Ok(QueryRef::Collection(CollectionQuery {
            collection: CollectionPath::parse(path)?,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }))
    }

    pub fn document(collection: &str, id: &str) -> Result<Self> {
        Ok(QueryRef::Document(DocumentRef::new(collection, id)?))
    }

    /// Collection the query reads from.
    pub fn collection_path(&self) -> &CollectionPath {
        match self {
            QueryRef::Document(doc) => &doc.collection,
            QueryRef::Collection(query) => &query.collection,
        }
    }
}

impl fmt::Display for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryRef::Document(doc) => write!(f, "doc({})", doc),
            QueryRef::Collection(query) => {
                write!(f, "collection({})", query.collection)?;
                if !query.filters.is_empty() {
                    write!(f, " where {} filter(s)", query.filters.len())?;
                }
                if let Some(limit) = query.limit {
                    write!(f, " limit {}", limit)?;
                }
                Ok(())
            }
        }
    }
}

/// A raw document as delivered by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Document body, normally a JSON object.
    pub fields: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Decode into a typed record. The document id is injected as the
    /// `id` field unless the body already carries one.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut body = match &self.fields {
            Value::Object(map) => map.clone(),
            other => {
                return Err(SyncError::Deserialization(format!(
                    "document '{}' is not an object: {}",
                    self.id, other
                )))
            }
        };
        body.entry("id")
            .or_insert_with(|| Value::String(self.id.clone()));

        serde_json::from_value(Value::Object(body))
            .map_err(|e| SyncError::Deserialization(format!("document '{}': {}", self.id, e)))
    }
}

/// Immutable value of a query at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot<T = Document> {
    /// The referenced document exists.
    Exists(T),
    /// The referenced document does not exist.
    Absent,
    /// Ordered result of a collection query.
    Collection(Vec<T>),
}

impl<T> Snapshot<T> {
    /// The document, for document snapshots that exist.
    pub fn document(&self) -> Option<&T> {
        match self {
            Snapshot::Exists(doc) => Some(doc),
            _ => None,
        }
    }

    /// The records, for collection snapshots.
    pub fn records(&self) -> Option<&[T]> {
        match self {
            Snapshot::Collection(records) => Some(records),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Exists(_) => 1,
            Snapshot::Absent => 0,
            Snapshot::Collection(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Snapshot<Document> {
    /// Decode every record of the snapshot into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Snapshot<T>> {
        Ok(match self {
            Snapshot::Exists(doc) => Snapshot::Exists(doc.decode()?),
            Snapshot::Absent => Snapshot::Absent,
            Snapshot::Collection(docs) => Snapshot::Collection(
                docs.iter()
                    .map(|doc| doc.decode::<T>())
                    .collect::<Result<Vec<T>>>()?,
            ),
        })
    }
}

/// Category of a subscription or mutation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No store handle installed yet.
    StoreUnavailable,
    PermissionDenied,
    NotFound,
    /// Network or backend unavailable.
    Unavailable,
    InvalidArgument,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StoreUnavailable => "store unavailable",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Why a subscription or mutation failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn store_unavailable() -> Self {
        Self::new(ErrorKind::StoreUnavailable, "store is not initialized")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&SyncError> for ErrorInfo {
    fn from(e: &SyncError) -> Self {
        let kind = match e {
            SyncError::StoreUnavailable => ErrorKind::StoreUnavailable,
            SyncError::InvalidPath(_)
            | SyncError::InvalidQuery(_)
            | SyncError::Serialization(_)
            | SyncError::Deserialization(_) => ErrorKind::InvalidArgument,
            SyncError::Io(_) | SyncError::DispatcherClosed => ErrorKind::Internal,
        };
        ErrorInfo::new(kind, e.to_string())
    }
}

/// A requested write. Dispatched once, then discarded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationIntent {
    /// Add a document with a store-assigned id.
    Create {
        collection: CollectionPath,
        payload: Value,
    },
    /// Write a document at a known id, replacing it or merging top-level
    /// fields when `merge` is set.
    Set {
        document: DocumentRef,
        payload: Value,
        merge: bool,
    },
    /// Merge top-level fields into an existing document.
    Update { document: DocumentRef, patch: Value },
    Delete { document: DocumentRef },
}

/// Kind of a mutation, for reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Set,
    Update,
    Delete,
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationOperation::Create => "create",
            MutationOperation::Set => "set",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl MutationIntent {
    pub fn operation(&self) -> MutationOperation {
        match self {
            MutationIntent::Create { .. } => MutationOperation::Create,
            MutationIntent::Set { .. } => MutationOperation::Set,
            MutationIntent::Update { .. } => MutationOperation::Update,
            MutationIntent::Delete { .. } => MutationOperation::Delete,
        }
    }

    pub fn collection(&self) -> &CollectionPath {
        match self {
            MutationIntent::Create { collection, .. } => collection,
            MutationIntent::Set { document, .. }
            | MutationIntent::Update { document, .. }
            | MutationIntent::Delete { document } => &document.collection,
        }
    }

    /// Human-readable target path (collection for creates, document
    /// path otherwise).
    pub fn target(&self) -> String {
        match self {
            MutationIntent::Create { collection, .. } => collection.to_string(),
            MutationIntent::Set { document, .. }
            | MutationIntent::Update { document, .. }
            | MutationIntent::Delete { document } => document.path(),
        }
    }
}
