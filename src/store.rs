//! Handle to the remote document store.
//!
//! The store itself is an external capability described by the
//! [`RemoteStore`] trait. A [`StoreHandle`] wraps one store instance with a
//! process-unique [`StoreId`]; the [`StoreSlot`] holds the handle for the
//! lifetime of the owning context and may be empty while the connection
//! is still being set up.

use crate::types::{ErrorInfo, MutationIntent, QueryRef, Snapshot};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving each new snapshot of a subscribed query.
pub type OnSnapshot = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Callback receiving a failure of a subscribed query.
pub type OnError = Arc<dyn Fn(ErrorInfo) + Send + Sync>;

/// Closes an upstream channel opened by [`RemoteStore::subscribe`].
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// An unsubscribe that does nothing (for channels that failed to open).
    pub fn noop() -> Self {
        Self(Box::new(|| {}))
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

/// The remote store as seen by the sync layer.
///
/// Implementations must not invoke callbacks while holding locks that
/// `subscribe` or the returned [`Unsubscribe`] also take: the sync layer
/// may re-enter the store from inside a callback.
pub trait RemoteStore: Send + Sync {
    /// Open a live channel for `query`. The store calls `on_snapshot` with
    /// every new full value and `on_error` when the channel fails.
    fn subscribe(
        &self,
        query: &QueryRef,
        on_snapshot: OnSnapshot,
        on_error: OnError,
    ) -> Unsubscribe;

    /// Perform a write. May block until the store acknowledges it; the
    /// sync layer only calls this from its dispatcher thread.
    fn write(&self, intent: &MutationIntent) -> Result<(), ErrorInfo>;
}

/// Process-unique identity of a store instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(pub u64);

impl StoreId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        StoreId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

/// Shared handle to one store instance. Clones share the same identity.
#[derive(Clone)]
pub struct StoreHandle {
    id: StoreId,
    store: Arc<dyn RemoteStore>,
}

impl StoreHandle {
    pub fn new<S: RemoteStore + 'static>(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            id: StoreId::next(),
            store,
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn subscribe(
        &self,
        query: &QueryRef,
        on_snapshot: OnSnapshot,
        on_error: OnError,
    ) -> Unsubscribe {
        self.store.subscribe(query, on_snapshot, on_error)
    }

    pub fn write(&self, intent: &MutationIntent) -> Result<(), ErrorInfo> {
        self.store.write(intent)
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle").field("id", &self.id).finish()
    }
}

/// Holder for the possibly-absent store handle.
#[derive(Clone, Default)]
pub struct StoreSlot {
    inner: Arc<RwLock<Option<StoreHandle>>>,
}

impl StoreSlot {
    /// A slot with no store installed yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(handle: StoreHandle) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(handle))),
        }
    }

    /// Install the store handle, returning the one it replaces.
    pub fn install(&self, handle: StoreHandle) -> Option<StoreHandle> {
        tracing::info!(store = ?handle.id(), "store handle installed");
        self.inner.write().replace(handle)
    }

    pub fn current(&self) -> Option<StoreHandle> {
        self.inner.read().clone()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl fmt::Debug for StoreSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSlot")
            .field("store", &self.inner.read().as_ref().map(|h| h.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    struct NullStore;

    impl RemoteStore for NullStore {
        fn subscribe(&self, _: &QueryRef, _: OnSnapshot, _: OnError) -> Unsubscribe {
            Unsubscribe::noop()
        }

        fn write(&self, _: &MutationIntent) -> Result<(), ErrorInfo> {
            Err(ErrorInfo::new(ErrorKind::Internal, "read-only"))
        }
    }

    #[test]
    fn test_handles_have_distinct_ids() {
        let a = StoreHandle::new(NullStore);
        let b = StoreHandle::new(NullStore);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_slot_install() {
        let slot = StoreSlot::empty();
        assert!(!slot.is_installed());
        assert!(slot.current().is_none());

        let handle = StoreHandle::new(NullStore);
        let id = handle.id();
        assert!(slot.install(handle).is_none());

        let shared = slot.clone();
        assert_eq!(shared.current().map(|h| h.id()), Some(id));
    }

    #[test]
    fn test_unsubscribe_runs_once() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let unsubscribe = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        unsubscribe.call();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
