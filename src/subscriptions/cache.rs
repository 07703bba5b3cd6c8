//! Per-query bookkeeping for the subscription manager.

use crate::query::QueryKey;
use crate::store::Unsubscribe;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;

use super::types::{ConsumerId, QueryResult, SubscriptionId, SubscriptionState};

/// Update queue of one attached consumer.
///
/// The cache keeps a receiving end too, so a full queue can shed its
/// oldest update and the newest state is always the last one queued.
pub(crate) struct ConsumerQueue {
    sender: Sender<QueryResult>,
    backlog: Receiver<QueryResult>,
}

impl ConsumerQueue {
    pub fn new(sender: Sender<QueryResult>, backlog: Receiver<QueryResult>) -> Self {
        Self { sender, backlog }
    }

    /// Queue `result`, dropping the oldest queued updates while full.
    /// Returns how many were dropped.
    fn push(&self, result: QueryResult) -> usize {
        let mut pending = result;
        let mut dropped = 0;
        loop {
            match self.sender.try_send(pending) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(back)) => {
                    if self.backlog.try_recv().is_ok() {
                        dropped += 1;
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return dropped,
            }
        }
    }
}

/// State of one upstream channel and the consumers attached to it.
pub(crate) struct CacheEntry {
    pub id: SubscriptionId,
    pub state: SubscriptionState,
    /// Attached consumers; their count is the reference count.
    pub consumers: HashMap<ConsumerId, ConsumerQueue>,
    /// Set once the store has returned from `subscribe`.
    pub unsubscribe: Option<Unsubscribe>,
}

impl CacheEntry {
    pub fn new(id: SubscriptionId) -> Self {
        Self {
            id,
            state: SubscriptionState::Subscribing,
            consumers: HashMap::new(),
            unsubscribe: None,
        }
    }

    pub fn refcount(&self) -> usize {
        self.consumers.len()
    }

    /// Push the current state to every consumer. A consumer whose buffer
    /// is full loses its oldest queued updates, never the newest state.
    pub fn publish(&self) {
        let result = self.state.result();
        for (consumer, queue) in &self.consumers {
            let dropped = queue.push(result.clone());
            if dropped > 0 {
                tracing::trace!(
                    subscription = self.id.0,
                    consumer = consumer.0,
                    dropped,
                    "consumer buffer full, oldest updates dropped"
                );
            }
        }
    }
}

/// Latest state and reference count per query identity.
#[derive(Default)]
pub(crate) struct ResultCache {
    entries: HashMap<QueryKey, CacheEntry>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, key: &QueryKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// The entry for `key`, only if it still belongs to channel `id`.
    pub fn current(&self, key: &QueryKey, id: SubscriptionId) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| entry.id == id)
    }

    pub fn current_mut(&mut self, key: &QueryKey, id: SubscriptionId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key).filter(|entry| entry.id == id)
    }

    pub fn insert(&mut self, key: QueryKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn state_of(&self, key: &QueryKey) -> SubscriptionState {
        self.entries
            .get(key)
            .map(|entry| entry.state.clone())
            .unwrap_or(SubscriptionState::Unattached)
    }

    pub fn refcount(&self, key: &QueryKey) -> usize {
        self.entries.get(key).map(CacheEntry::refcount).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.entries.values().map(CacheEntry::refcount).sum()
    }
}
