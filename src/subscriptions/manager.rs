//! Subscription manager: one upstream channel per query, fanned out to
//! every attached consumer.

use crate::query::QueryKey;
use crate::store::{OnError, OnSnapshot, StoreHandle};
use crate::surface::{ErrorSurface, Failure};
use crate::types::{ErrorInfo, ErrorKind, Snapshot};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::cache::{CacheEntry, ConsumerQueue, ResultCache};
use super::types::{
    ConsumerId, ManagerStats, QueryResult, SubscriptionConfig, SubscriptionId, SubscriptionState,
};

/// State shared between the manager, its attachments and the callbacks
/// handed to the store.
struct Shared {
    cache: Mutex<ResultCache>,
    config: SubscriptionConfig,
    surface: Arc<dyn ErrorSurface>,
    next_subscription: AtomicU64,
    next_consumer: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl Shared {
    fn deliver_snapshot(&self, key: &QueryKey, id: SubscriptionId, snapshot: Snapshot) {
        let mut cache = self.cache.lock();
        let Some(entry) = cache.current_mut(key, id) else {
            tracing::trace!(
                query = %key.query,
                subscription = id.0,
                "snapshot for closed channel dropped"
            );
            return;
        };

        tracing::debug!(
            query = %key.query,
            subscription = id.0,
            records = snapshot.len(),
            consumers = entry.refcount(),
            "snapshot received"
        );
        entry.state = SubscriptionState::Live(Arc::new(snapshot));
        entry.publish();
    }

    fn deliver_error(&self, key: &QueryKey, id: SubscriptionId, error: ErrorInfo) {
        {
            let mut cache = self.cache.lock();
            let Some(entry) = cache.current_mut(key, id) else {
                tracing::trace!(
                    query = %key.query,
                    subscription = id.0,
                    "error for closed channel dropped"
                );
                return;
            };
            entry.state = SubscriptionState::Error(error.clone());
            entry.publish();
        }

        tracing::warn!(
            query = %key.query,
            subscription = id.0,
            error = %error,
            "subscription failed"
        );

        if self.config.notify_on_error {
            Failure::Subscription {
                query: key.query.clone(),
                cause: error,
            }
            .report(self.surface.as_ref());
        }
    }

    fn detach(&self, key: &QueryKey, id: SubscriptionId, consumer: ConsumerId) {
        let released = {
            let mut cache = self.cache.lock();
            match cache.current_mut(key, id) {
                Some(entry) => {
                    entry.consumers.remove(&consumer);
                    if entry.consumers.is_empty() {
                        cache.remove(key)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let Some(entry) = released else {
            return;
        };

        self.closed.fetch_add(1, Ordering::SeqCst);
        match entry.unsubscribe {
            Some(unsubscribe) => {
                tracing::debug!(
                    query = %key.query,
                    subscription = id.0,
                    "closing upstream channel"
                );
                unsubscribe.call();
            }
            // The attaching thread is still inside `subscribe`; it closes
            // the channel itself once it finds the entry gone.
            None => {
                tracing::debug!(
                    query = %key.query,
                    subscription = id.0,
                    "channel released while opening"
                );
            }
        }
    }
}

/// Owns the live channels, keyed by query identity.
///
/// At most one upstream channel exists per [`QueryKey`]. The channel is
/// opened by the first [`attach`](Self::attach) and closed when the last
/// [`Attachment`] is detached or dropped.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(config: SubscriptionConfig, surface: Arc<dyn ErrorSurface>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache: Mutex::new(ResultCache::new()),
                config,
                surface,
                next_subscription: AtomicU64::new(1),
                next_consumer: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a consumer to `key`, opening the upstream channel on `store`
    /// if no other consumer holds it.
    ///
    /// The returned attachment carries the current state and receives
    /// every later state change until it is detached.
    ///
    /// A key computed against another store yields an attachment in the
    /// `Error` state and opens nothing.
    pub fn attach(&self, key: QueryKey, store: &StoreHandle) -> Attachment {
        let consumer = ConsumerId(self.shared.next_consumer.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.shared.config.buffer_size.max(1));

        if key.store != store.id() {
            tracing::warn!(
                query = %key.query,
                key_store = ?key.store,
                store = ?store.id(),
                "query key belongs to another store"
            );
            let error = ErrorInfo::new(
                ErrorKind::InvalidArgument,
                format!("query {} was keyed for another store", key.query),
            );
            let mut attachment = self.attachment(key, SubscriptionId(0), consumer, receiver);
            attachment.detached = true;
            attachment.rejected = Some(error);
            return attachment;
        }

        let queue = ConsumerQueue::new(sender, receiver.clone());

        let mut cache = self.shared.cache.lock();
        if let Some(entry) = cache.get_mut(&key) {
            entry.consumers.insert(consumer, queue);
            let subscription = entry.id;
            tracing::trace!(
                query = %key.query,
                subscription = subscription.0,
                consumers = entry.refcount(),
                "consumer joined channel"
            );
            drop(cache);
            return self.attachment(key, subscription, consumer, receiver);
        }

        let subscription =
            SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        let mut entry = CacheEntry::new(subscription);
        entry.consumers.insert(consumer, queue);
        cache.insert(key.clone(), entry);
        drop(cache);

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            query = %key.query,
            subscription = subscription.0,
            "opening upstream channel"
        );

        // The store may emit synchronously from inside `subscribe`, so the
        // cache lock must not be held here.
        let unsubscribe = store.subscribe(
            &key.query,
            self.snapshot_callback(key.clone(), subscription),
            self.error_callback(key.clone(), subscription),
        );

        let mut cache = self.shared.cache.lock();
        match cache.current_mut(&key, subscription) {
            Some(entry) => entry.unsubscribe = Some(unsubscribe),
            None => {
                drop(cache);
                tracing::debug!(
                    query = %key.query,
                    subscription = subscription.0,
                    "closing channel released during open"
                );
                unsubscribe.call();
            }
        }

        self.attachment(key, subscription, consumer, receiver)
    }

    /// Current state for `key` (`Unattached` when nobody holds it).
    pub fn state(&self, key: &QueryKey) -> SubscriptionState {
        self.shared.cache.lock().state_of(key)
    }

    /// Number of consumers attached to `key`.
    pub fn refcount(&self, key: &QueryKey) -> usize {
        self.shared.cache.lock().refcount(key)
    }

    pub fn stats(&self) -> ManagerStats {
        let cache = self.shared.cache.lock();
        ManagerStats {
            channels_opened: self.shared.opened.load(Ordering::SeqCst),
            channels_closed: self.shared.closed.load(Ordering::SeqCst),
            active_channels: cache.len(),
            attached_consumers: cache.consumer_count(),
        }
    }

    fn attachment(
        &self,
        key: QueryKey,
        subscription: SubscriptionId,
        consumer: ConsumerId,
        receiver: Receiver<QueryResult>,
    ) -> Attachment {
        Attachment {
            key,
            subscription,
            consumer,
            receiver,
            shared: Arc::downgrade(&self.shared),
            detached: false,
            rejected: None,
        }
    }

    fn snapshot_callback(&self, key: QueryKey, id: SubscriptionId) -> OnSnapshot {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |snapshot| {
            if let Some(shared) = shared.upgrade() {
                shared.deliver_snapshot(&key, id, snapshot);
            }
        })
    }

    fn error_callback(&self, key: QueryKey, id: SubscriptionId) -> OnError {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |error| {
            if let Some(shared) = shared.upgrade() {
                shared.deliver_error(&key, id, error);
            }
        })
    }
}

/// One consumer's hold on a live query. Detaches on drop.
pub struct Attachment {
    key: QueryKey,
    subscription: SubscriptionId,
    consumer: ConsumerId,
    receiver: Receiver<QueryResult>,
    shared: Weak<Shared>,
    detached: bool,
    /// Set when the attach was refused; no channel backs this attachment.
    rejected: Option<ErrorInfo>,
}

impl Attachment {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription
    }

    /// Latest state of the channel this attachment holds.
    pub fn state(&self) -> SubscriptionState {
        if let Some(error) = &self.rejected {
            return SubscriptionState::Error(error.clone());
        }
        match self.shared.upgrade() {
            Some(shared) => shared
                .cache
                .lock()
                .current(&self.key, self.subscription)
                .map(|entry| entry.state.clone())
                .unwrap_or(SubscriptionState::Unattached),
            None => SubscriptionState::Unattached,
        }
    }

    pub fn result(&self) -> QueryResult {
        self.state().result()
    }

    /// Channel of pushed updates, in the order the store emitted them.
    ///
    /// A consumer that falls `buffer_size` updates behind loses the oldest
    /// queued ones; the last update queued is always the current state.
    pub fn updates(&self) -> &Receiver<QueryResult> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Result<QueryResult, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<QueryResult, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Release this consumer's hold. Closes the upstream channel if it was
    /// the last one.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(&self.key, self.subscription, self.consumer);
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("query", &self.key.query)
            .field("subscription", &self.subscription)
            .field("consumer", &self.consumer)
            .finish()
    }
}
