//! Subscription types for live query results.

use crate::error::Result;
use crate::types::{Document, ErrorInfo, Snapshot};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Configuration for the subscription manager.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered updates per consumer. When a consumer falls behind,
    /// its oldest queued updates are dropped so the newest state is
    /// always delivered last.
    /// Default: 64
    pub buffer_size: usize,

    /// Also report subscription errors to the error surface.
    /// Default: true
    pub notify_on_error: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            notify_on_error: true,
        }
    }
}

/// Unique identifier for one upstream channel.
///
/// A query that is closed and re-opened gets a new id, so late callbacks
/// from the old channel can be told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Unique identifier for one attached consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

/// Lifecycle state of a subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionState {
    /// No channel (no store, or no consumer).
    Unattached,
    /// Channel opened, no snapshot yet.
    Subscribing,
    /// Latest snapshot from the store.
    Live(Arc<Snapshot>),
    /// Channel failed. Any earlier snapshot is discarded.
    Error(ErrorInfo),
}

impl SubscriptionState {
    /// The consumer-facing view of this state.
    pub fn result(&self) -> QueryResult {
        match self {
            SubscriptionState::Unattached => QueryResult::idle(),
            SubscriptionState::Subscribing => QueryResult::loading(),
            SubscriptionState::Live(snapshot) => QueryResult::live(Arc::clone(snapshot)),
            SubscriptionState::Error(error) => QueryResult::failed(error.clone()),
        }
    }
}

/// What a consumer sees for its query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult<T = Document> {
    pub data: Option<Arc<Snapshot<T>>>,
    pub is_loading: bool,
    pub error: Option<ErrorInfo>,
}

impl<T> QueryResult<T> {
    /// Not loading, no data, no error.
    pub fn idle() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
        }
    }

    pub fn loading() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
        }
    }

    pub fn live(snapshot: Arc<Snapshot<T>>) -> Self {
        Self {
            data: Some(snapshot),
            is_loading: false,
            error: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            data: None,
            is_loading: false,
            error: Some(error),
        }
    }
}

impl<T> Default for QueryResult<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl QueryResult<Document> {
    /// Decode the data into typed records, keeping loading/error state.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<QueryResult<T>> {
        let data = match &self.data {
            Some(snapshot) => Some(Arc::new(snapshot.decode::<T>()?)),
            None => None,
        };
        Ok(QueryResult {
            data,
            is_loading: self.is_loading,
            error: self.error.clone(),
        })
    }
}

/// Counters describing the manager's channels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub active_channels: usize,
    pub attached_consumers: usize,
}
