//! Query descriptors and stable query identity.
//!
//! Consumers describe what they want to read with a [`QueryDescriptor`],
//! usually rebuilt from scratch every time their context re-evaluates. The
//! [`QueryIdentityMemoizer`] turns descriptors into [`QueryKey`]s that
//! compare equal whenever the descriptors are structurally equal and the
//! store instance is the same, so rebuilding a descriptor never churns the
//! underlying subscription.

use crate::error::{Result, SyncError};
use crate::store::{StoreHandle, StoreId};
use crate::types::{CollectionPath, CollectionQuery, DocumentRef, Filter, OrderBy, QueryRef};

/// Logical shape of a query, as written by a consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryDescriptor {
    Document {
        collection: String,
        id: String,
    },
    Collection {
        collection: String,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<usize>,
    },
}

impl QueryDescriptor {
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        QueryDescriptor::Document {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(collection: impl Into<String>) -> Self {
        QueryDescriptor::Collection {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Add a filter. No effect on document descriptors.
    pub fn filter(mut self, filter: Filter) -> Self {
        if let QueryDescriptor::Collection { filters, .. } = &mut self {
            filters.push(filter);
        }
        self
    }

    /// Add an ordering clause. No effect on document descriptors.
    pub fn order_by(mut self, clause: OrderBy) -> Self {
        if let QueryDescriptor::Collection { order_by, .. } = &mut self {
            order_by.push(clause);
        }
        self
    }

    /// Cap the number of records. No effect on document descriptors.
    pub fn limit(mut self, n: usize) -> Self {
        if let QueryDescriptor::Collection { limit, .. } = &mut self {
            *limit = Some(n);
        }
        self
    }

    /// Validate and normalize into a [`QueryRef`].
    ///
    /// Filters are conjunctive, so they are sorted and deduplicated; the
    /// order of ordering clauses is significant and kept.
    pub fn to_query_ref(&self) -> Result<QueryRef> {
        match self {
            QueryDescriptor::Document { collection, id } => {
                Ok(QueryRef::Document(DocumentRef::new(collection, id)?))
            }
            QueryDescriptor::Collection {
                collection,
                filters,
                order_by,
                limit,
            } => {
                if *limit == Some(0) {
                    return Err(SyncError::InvalidQuery(format!(
                        "limit on '{}' must be positive",
                        collection
                    )));
                }
                if let Some(f) = filters.iter().find(|f| f.field.is_empty()) {
                    return Err(SyncError::InvalidQuery(format!(
                        "filter on '{}' has an empty field name ({:?})",
                        collection, f.op
                    )));
                }
                if order_by.iter().any(|o| o.field.is_empty()) {
                    return Err(SyncError::InvalidQuery(format!(
                        "ordering on '{}' has an empty field name",
                        collection
                    )));
                }

                let mut filters = filters.clone();
                filters.sort();
                filters.dedup();

                Ok(QueryRef::Collection(CollectionQuery {
                    collection: CollectionPath::parse(collection)?,
                    filters,
                    order_by: order_by.clone(),
                    limit: *limit,
                }))
            }
        }
    }
}

impl From<&QueryRef> for QueryDescriptor {
    fn from(query: &QueryRef) -> Self {
        match query {
            QueryRef::Document(doc) => {
                QueryDescriptor::document(doc.collection.as_str(), doc.id.as_str())
            }
            QueryRef::Collection(q) => QueryDescriptor::Collection {
                collection: q.collection.as_str().to_string(),
                filters: q.filters.clone(),
                order_by: q.order_by.clone(),
                limit: q.limit,
            },
        }
    }
}

/// Identity of a live query: the store instance plus the normalized query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub store: StoreId,
    pub query: QueryRef,
}

/// Compute the identity of `descriptor` against `store`.
pub fn identity_of(descriptor: &QueryDescriptor, store: &StoreHandle) -> Result<QueryKey> {
    Ok(QueryKey {
        store: store.id(),
        query: descriptor.to_query_ref()?,
    })
}

/// Remembers the last descriptor a consumer asked for.
///
/// Re-issuing an equal descriptor against the same store returns the
/// cached key without re-normalizing it.
#[derive(Debug, Default)]
pub struct QueryIdentityMemoizer {
    last: Option<(QueryDescriptor, QueryKey)>,
}

impl QueryIdentityMemoizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of `descriptor`, or `None` while no store is installed.
    pub fn identity_of(
        &mut self,
        descriptor: &QueryDescriptor,
        store: Option<&StoreHandle>,
    ) -> Result<Option<QueryKey>> {
        let Some(store) = store else {
            // Still reject malformed descriptors, but there is nothing to key on.
            descriptor.to_query_ref()?;
            return Ok(None);
        };

        if let Some((last_descriptor, last_key)) = &self.last {
            if last_key.store == store.id() && last_descriptor == descriptor {
                return Ok(Some(last_key.clone()));
            }
        }

        let key = identity_of(descriptor, store)?;
        self.last = Some((descriptor.clone(), key.clone()));
        Ok(Some(key))
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
