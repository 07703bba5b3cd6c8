//! Root context tying the store handle, subscriptions and mutations
//! together.

use crate::error::Result;
use crate::mutations::{DispatchConfig, MutationDispatcher};
use crate::query::{QueryDescriptor, QueryIdentityMemoizer};
use crate::store::{StoreHandle, StoreSlot};
use crate::subscriptions::{Attachment, QueryResult, SubscriptionConfig, SubscriptionManager};
use crate::surface::{ErrorSurface, TracingSurface};
use crate::types::{CollectionPath, DocumentId, DocumentRef, ErrorInfo, MutationIntent, QueryRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Sync layer configuration.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    pub subscriptions: SubscriptionConfig,
    pub dispatch: DispatchConfig,
}

/// Owns everything the sync layer needs for the lifetime of the
/// application: the store slot, the subscription manager, the mutation
/// dispatcher and the error surface.
///
/// Pages and panels call [`observe`](Self::observe) for live data and the
/// `dispatch_*` methods for writes.
pub struct SyncContext {
    slot: StoreSlot,
    manager: SubscriptionManager,
    dispatcher: MutationDispatcher,
    surface: Arc<dyn ErrorSurface>,
}

impl SyncContext {
    /// Create a context with no store installed yet.
    pub fn new(config: SyncConfig, surface: Arc<dyn ErrorSurface>) -> Result<Self> {
        Self::with_slot(config, StoreSlot::empty(), surface)
    }

    /// Create a context bound to `store`.
    pub fn with_store(
        config: SyncConfig,
        store: StoreHandle,
        surface: Arc<dyn ErrorSurface>,
    ) -> Result<Self> {
        Self::with_slot(config, StoreSlot::with(store), surface)
    }

    /// Create a context that reports failures to the `tracing` log.
    pub fn headless(config: SyncConfig, store: Option<StoreHandle>) -> Result<Self> {
        let slot = store.map(StoreSlot::with).unwrap_or_default();
        Self::with_slot(config, slot, Arc::new(TracingSurface))
    }

    fn with_slot(
        config: SyncConfig,
        slot: StoreSlot,
        surface: Arc<dyn ErrorSurface>,
    ) -> Result<Self> {
        let manager = SubscriptionManager::new(config.subscriptions, Arc::clone(&surface));
        let dispatcher =
            MutationDispatcher::new(config.dispatch, slot.clone(), Arc::clone(&surface))?;
        Ok(Self {
            slot,
            manager,
            dispatcher,
            surface,
        })
    }

    /// Install the store once its connection is ready. Existing observers
    /// pick it up on their next [`Observer::refresh`].
    pub fn install_store(&self, store: StoreHandle) {
        if let Some(previous) = self.slot.install(store) {
            tracing::warn!(previous = ?previous.id(), "store handle replaced");
        }
    }

    pub fn store(&self) -> Option<StoreHandle> {
        self.slot.current()
    }

    pub fn surface(&self) -> &Arc<dyn ErrorSurface> {
        &self.surface
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.manager
    }

    pub fn dispatcher(&self) -> &MutationDispatcher {
        &self.dispatcher
    }

    /// Start observing `descriptor`.
    pub fn observe(&self, descriptor: QueryDescriptor) -> Observer {
        let mut observer = self.observer();
        observer.set_query(Some(descriptor));
        observer
    }

    /// An observer with no query yet.
    pub fn observer(&self) -> Observer {
        Observer {
            slot: self.slot.clone(),
            manager: self.manager.clone(),
            memo: QueryIdentityMemoizer::new(),
            descriptor: None,
            attachment: None,
            invalid: None,
        }
    }

    /// A reference to a new document with a client-generated id, so the id
    /// can be embedded in the payload before it is written.
    pub fn reserve_document(&self, collection: &str) -> Result<DocumentRef> {
        Ok(CollectionPath::parse(collection)?.doc(DocumentId::generate()))
    }

    pub fn submit(&self, intent: MutationIntent) {
        self.dispatcher.submit(intent);
    }

    pub fn dispatch_create<P: Serialize + ?Sized>(&self, collection: &str, payload: &P) {
        self.dispatcher.dispatch_create(collection, payload);
    }

    pub fn dispatch_set<P: Serialize + ?Sized>(
        &self,
        document: &DocumentRef,
        payload: &P,
        merge: bool,
    ) {
        self.dispatcher.dispatch_set(document, payload, merge);
    }

    pub fn dispatch_update<P: Serialize + ?Sized>(&self, document: &DocumentRef, patch: &P) {
        self.dispatcher.dispatch_update(document, patch);
    }

    pub fn dispatch_delete(&self, document: &DocumentRef) {
        self.dispatcher.dispatch_delete(document);
    }

    /// Stop the dispatcher after the queued writes finish.
    pub fn shutdown(self) {
        tracing::info!("sync context shutting down");
        self.dispatcher.shutdown();
    }
}

/// A consumer's live view of one query.
///
/// The observer attaches to the subscription for its current query and
/// detaches when the query changes or the observer is dropped.
pub struct Observer {
    slot: StoreSlot,
    manager: SubscriptionManager,
    memo: QueryIdentityMemoizer,
    descriptor: Option<QueryDescriptor>,
    attachment: Option<Attachment>,
    invalid: Option<ErrorInfo>,
}

impl Observer {
    /// Current `{data, is_loading, error}` for the observed query.
    pub fn result(&self) -> QueryResult {
        if let Some(error) = &self.invalid {
            return QueryResult::failed(error.clone());
        }
        match &self.attachment {
            Some(attachment) => attachment.result(),
            None => QueryResult::idle(),
        }
    }

    /// Current result with data decoded into `T`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<QueryResult<T>> {
        self.result().decode()
    }

    /// The query this observer is attached to, if any.
    pub fn query(&self) -> Option<&QueryRef> {
        self.attachment.as_ref().map(|a| &a.key().query)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Switch to another query (or none). Equal descriptors keep the
    /// current subscription.
    pub fn set_query(&mut self, descriptor: Option<QueryDescriptor>) {
        self.descriptor = descriptor;
        self.refresh();
    }

    /// Re-evaluate the query identity against the current store, attaching
    /// if a store was installed since the last evaluation.
    pub fn refresh(&mut self) {
        let store = self.slot.current();
        let Some(descriptor) = &self.descriptor else {
            self.attachment = None;
            self.invalid = None;
            return;
        };

        match self.memo.identity_of(descriptor, store.as_ref()) {
            Err(e) => {
                tracing::warn!(error = %e, "invalid query descriptor");
                self.attachment = None;
                self.invalid = Some((&e).into());
            }
            Ok(None) => {
                tracing::trace!("no store installed, observer stays unattached");
                self.attachment = None;
                self.invalid = None;
            }
            Ok(Some(key)) => {
                self.invalid = None;
                if self.attachment.as_ref().map(Attachment::key) == Some(&key) {
                    return;
                }
                // Detach from the old query before attaching to the new one.
                self.attachment = None;
                if let Some(store) = store {
                    self.attachment = Some(self.manager.attach(key, &store));
                }
            }
        }
    }

    /// Stop observing.
    pub fn detach(&mut self) {
        self.set_query(None);
    }

    /// Next pushed update, if one is waiting.
    pub fn try_recv(&self) -> Option<QueryResult> {
        self.attachment.as_ref().and_then(|a| a.try_recv().ok())
    }

    /// Wait up to `timeout` for the next pushed update. Returns `None`
    /// immediately when not attached.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<QueryResult> {
        self.attachment
            .as_ref()
            .and_then(|a| a.recv_timeout(timeout).ok())
    }

    /// Wait up to `timeout` for an update satisfying `pred`, skipping
    /// others. Checks the current result first.
    pub fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> Option<QueryResult>
    where
        F: FnMut(&QueryResult) -> bool,
    {
        let current = self.result();
        if pred(&current) {
            return Some(current);
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let update = self.recv_timeout(remaining)?;
            if pred(&update) {
                return Some(update);
            }
        }
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("descriptor", &self.descriptor)
            .field("attachment", &self.attachment)
            .finish()
    }
}
