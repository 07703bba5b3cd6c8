//! Non-blocking mutation dispatcher.

use crate::error::{Result, SyncError};
use crate::store::{StoreHandle, StoreSlot};
use crate::surface::{ErrorSurface, Failure};
use crate::types::{
    CollectionPath, DocumentRef, ErrorInfo, ErrorKind, MutationIntent, MutationOperation,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration for the mutation dispatcher.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Name of the queue thread; write threads get a `-write` suffix.
    /// Default: "docsync-dispatch"
    pub thread_name: String,

    /// How long the queue waits for a write before starting the next one.
    /// A write still running after this keeps going on its own thread and
    /// no longer holds up later writes. It is never cancelled.
    /// Default: 250ms
    pub stall_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            thread_name: "docsync-dispatch".to_string(),
            stall_after: Duration::from_millis(250),
        }
    }
}

/// Dispatcher counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Intents queued for the worker.
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Intents refused before queueing (no store, bad payload, closed).
    pub rejected: u64,
}

impl DispatchStats {
    /// Queued intents that have not completed yet.
    pub fn in_flight(&self) -> u64 {
        self.submitted - self.succeeded - self.failed
    }
}

#[derive(Default)]
struct Counters {
    stats: Mutex<DispatchStats>,
    settled: Condvar,
}

impl Counters {
    fn update(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut self.stats.lock());
        self.settled.notify_all();
    }
}

struct Job {
    intent: MutationIntent,
    store: StoreHandle,
}

/// Accepts mutation intents and performs them on a background thread.
///
/// Every `dispatch_*` call returns as soon as the intent is queued. Writes
/// start in submission order, exactly once each, and normally finish in
/// that order too. A write that outlasts [`DispatchConfig::stall_after`]
/// keeps running but no longer delays the ones behind it. Success is
/// observed through the subscriptions that watch the written data; failure
/// goes to the error surface and never back to the caller.
pub struct MutationDispatcher {
    slot: StoreSlot,
    surface: Arc<dyn ErrorSurface>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl MutationDispatcher {
    /// Start the dispatcher and its worker thread.
    pub fn new(
        config: DispatchConfig,
        slot: StoreSlot,
        surface: Arc<dyn ErrorSurface>,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let counters = Arc::new(Counters::default());

        let worker = {
            let writer = Writer {
                surface: Arc::clone(&surface),
                counters: Arc::clone(&counters),
                thread_name: format!("{}-write", config.thread_name),
                stall_after: config.stall_after,
            };
            thread::Builder::new()
                .name(config.thread_name)
                .spawn(move || run_worker(receiver, writer))?
        };

        Ok(Self {
            slot,
            surface,
            sender: Some(sender),
            worker: Some(worker),
            counters,
        })
    }

    /// Queue `intent` for writing. Never blocks and never fails: problems
    /// are reported to the error surface.
    pub fn submit(&self, intent: MutationIntent) {
        let Some(store) = self.slot.current() else {
            tracing::warn!(
                operation = %intent.operation(),
                target = %intent.target(),
                "mutation rejected, store not available"
            );
            self.counters.update(|s| s.rejected += 1);
            Failure::StoreUnavailable {
                operation: format!("{} {}", intent.operation(), intent.target()),
            }
            .report(self.surface.as_ref());
            return;
        };

        let operation = intent.operation();
        let target = intent.target();

        let Some(sender) = &self.sender else {
            self.reject(operation, target, closed());
            return;
        };

        self.counters.update(|s| s.submitted += 1);
        tracing::debug!(operation = %operation, target = %target, "mutation submitted");

        if sender.send(Job { intent, store }).is_err() {
            // Worker is gone; undo the submit count so in-flight stays honest.
            self.counters.update(|s| s.submitted -= 1);
            self.reject(operation, target, closed());
        }
    }

    /// Add a document with a store-assigned id.
    pub fn dispatch_create<P: Serialize + ?Sized>(&self, collection: &str, payload: &P) {
        let collection = match CollectionPath::parse(collection) {
            Ok(path) => path,
            Err(e) => {
                return self.reject(MutationOperation::Create, collection.to_string(), (&e).into())
            }
        };
        match to_object(payload) {
            Ok(payload) => self.submit(MutationIntent::Create {
                collection,
                payload,
            }),
            Err(cause) => self.reject(MutationOperation::Create, collection.to_string(), cause),
        }
    }

    /// Write a document at a known id.
    pub fn dispatch_set<P: Serialize + ?Sized>(
        &self,
        document: &DocumentRef,
        payload: &P,
        merge: bool,
    ) {
        match to_object(payload) {
            Ok(payload) => self.submit(MutationIntent::Set {
                document: document.clone(),
                payload,
                merge,
            }),
            Err(cause) => self.reject(MutationOperation::Set, document.path(), cause),
        }
    }

    /// Merge top-level fields into an existing document.
    pub fn dispatch_update<P: Serialize + ?Sized>(&self, document: &DocumentRef, patch: &P) {
        match to_object(patch) {
            Ok(patch) => self.submit(MutationIntent::Update {
                document: document.clone(),
                patch,
            }),
            Err(cause) => self.reject(MutationOperation::Update, document.path(), cause),
        }
    }

    pub fn dispatch_delete(&self, document: &DocumentRef) {
        self.submit(MutationIntent::Delete {
            document: document.clone(),
        });
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.stats.lock().clone()
    }

    /// Block until every queued intent has completed or `timeout` elapses.
    /// Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stats = self.counters.stats.lock();
        while stats.in_flight() > 0 {
            if self.counters.settled.wait_until(&mut stats, deadline).timed_out() {
                return stats.in_flight() == 0;
            }
        }
        true
    }

    /// Stop accepting intents and wait until every queued write has run,
    /// or has stalled and been left running on its own thread.
    pub fn shutdown(mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("dispatcher worker panicked");
            }
        }
    }

    fn reject(&self, operation: MutationOperation, target: String, cause: ErrorInfo) {
        tracing::warn!(
            operation = %operation,
            target = %target,
            error = %cause,
            "mutation rejected"
        );
        self.counters.update(|s| s.rejected += 1);
        Failure::Mutation {
            operation,
            target,
            cause,
        }
        .report(self.surface.as_ref());
    }
}

impl Drop for MutationDispatcher {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish what is queued and exit;
        // in-flight writes are never cancelled.
        self.sender.take();
    }
}

/// What each write thread needs besides its job.
struct Writer {
    surface: Arc<dyn ErrorSurface>,
    counters: Arc<Counters>,
    thread_name: String,
    stall_after: Duration,
}

fn run_worker(receiver: Receiver<Job>, writer: Writer) {
    for job in receiver.iter() {
        let operation = job.intent.operation();
        let target = job.intent.target();
        let (done, finished) = bounded::<()>(1);

        let spawned = {
            let surface = Arc::clone(&writer.surface);
            let counters = Arc::clone(&writer.counters);
            thread::Builder::new()
                .name(writer.thread_name.clone())
                .spawn(move || {
                    perform(job, surface.as_ref(), &counters);
                    let _ = done.send(());
                })
        };

        if let Err(e) = spawned {
            tracing::error!(
                operation = %operation,
                target = %target,
                error = %e,
                "could not start write"
            );
            writer.counters.update(|s| s.failed += 1);
            Failure::Mutation {
                operation,
                target,
                cause: ErrorInfo::new(
                    ErrorKind::Internal,
                    format!("could not start write: {}", e),
                ),
            }
            .report(writer.surface.as_ref());
            continue;
        }

        match finished.recv_timeout(writer.stall_after) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    operation = %operation,
                    target = %target,
                    stall_ms = writer.stall_after.as_millis() as u64,
                    "write still pending, starting the next one"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!(
                    operation = %operation,
                    target = %target,
                    "write thread panicked"
                );
                writer.counters.update(|s| s.failed += 1);
            }
        }
    }
    tracing::debug!("dispatcher worker stopped");
}

/// Run one write and settle its outcome.
fn perform(job: Job, surface: &dyn ErrorSurface, counters: &Counters) {
    let operation = job.intent.operation();
    let target = job.intent.target();

    match job.store.write(&job.intent) {
        Ok(()) => {
            tracing::debug!(operation = %operation, target = %target, "mutation applied");
            counters.update(|s| s.succeeded += 1);
        }
        Err(cause) => {
            tracing::warn!(
                operation = %operation,
                target = %target,
                error = %cause,
                "mutation failed"
            );
            counters.update(|s| s.failed += 1);
            Failure::Mutation {
                operation,
                target,
                cause,
            }
            .report(surface);
        }
    }
}

fn to_object<P: Serialize + ?Sized>(payload: &P) -> std::result::Result<Value, ErrorInfo> {
    match serde_json::to_value(payload) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(ErrorInfo::new(
            ErrorKind::InvalidArgument,
            format!("payload must be an object, got {}", other),
        )),
        Err(e) => Err(ErrorInfo::new(ErrorKind::InvalidArgument, e.to_string())),
    }
}

fn closed() -> ErrorInfo {
    (&SyncError::DispatcherClosed).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OnError, OnSnapshot, RemoteStore, Unsubscribe};
    use crate::surface::{NoticeLevel, RecordingSurface};
    use crate::types::QueryRef;
    use serde_json::json;

    /// Store double whose writes wait on a gate and record their order.
    struct GatedStore {
        gate: crossbeam_channel::Receiver<std::result::Result<(), ErrorInfo>>,
        written: Mutex<Vec<String>>,
    }

    impl RemoteStore for Arc<GatedStore> {
        fn subscribe(&self, _: &QueryRef, _: OnSnapshot, _: OnError) -> Unsubscribe {
            Unsubscribe::noop()
        }

        fn write(&self, intent: &MutationIntent) -> std::result::Result<(), ErrorInfo> {
            let outcome = self
                .gate
                .recv()
                .unwrap_or_else(|_| Err(ErrorInfo::new(ErrorKind::Unavailable, "gate closed")));
            self.written.lock().push(intent.target());
            outcome
        }
    }

    fn gated() -> (
        crossbeam_channel::Sender<std::result::Result<(), ErrorInfo>>,
        Arc<GatedStore>,
        MutationDispatcher,
        Arc<RecordingSurface>,
    ) {
        let (open, gate) = unbounded();
        let store = Arc::new(GatedStore {
            gate,
            written: Mutex::new(Vec::new()),
        });
        let surface = Arc::new(RecordingSurface::new());
        let dispatcher = MutationDispatcher::new(
            DispatchConfig::default(),
            StoreSlot::with(StoreHandle::new(Arc::clone(&store))),
            surface.clone(),
        )
        .unwrap();
        (open, store, dispatcher, surface)
    }

    #[test]
    fn test_submit_returns_before_write_completes() {
        let (open, _store, dispatcher, surface) = gated();

        dispatcher.dispatch_create("products", &json!({"name": "Hat"}));
        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.in_flight(), 1);

        open.send(Ok(())).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)));
        assert_eq!(dispatcher.stats().succeeded, 1);
        assert!(surface.is_empty());
    }

    #[test]
    fn test_writes_run_in_submission_order() {
        let (open, store, dispatcher, _) = gated();

        for id in ["a", "b", "c"] {
            dispatcher.dispatch_delete(&DocumentRef::new("orders", id).unwrap());
        }
        for _ in 0..3 {
            open.send(Ok(())).unwrap();
        }

        assert!(dispatcher.wait_idle(Duration::from_secs(5)));
        assert_eq!(
            *store.written.lock(),
            vec!["orders/a".to_string(), "orders/b".into(), "orders/c".into()]
        );
    }

    /// Store double that holds `orders` writes until released and applies
    /// everything else at once.
    struct StallingStore {
        release: crossbeam_channel::Receiver<()>,
        written: Mutex<Vec<String>>,
    }

    impl RemoteStore for Arc<StallingStore> {
        fn subscribe(&self, _: &QueryRef, _: OnSnapshot, _: OnError) -> Unsubscribe {
            Unsubscribe::noop()
        }

        fn write(&self, intent: &MutationIntent) -> std::result::Result<(), ErrorInfo> {
            if intent.target().starts_with("orders/") {
                let _ = self.release.recv();
            }
            self.written.lock().push(intent.target());
            Ok(())
        }
    }

    #[test]
    fn test_hung_write_does_not_block_later_writes() {
        let (release, held) = unbounded();
        let store = Arc::new(StallingStore {
            release: held,
            written: Mutex::new(Vec::new()),
        });
        let config = DispatchConfig {
            stall_after: Duration::from_millis(50),
            ..Default::default()
        };
        let dispatcher = MutationDispatcher::new(
            config,
            StoreSlot::with(StoreHandle::new(Arc::clone(&store))),
            Arc::new(RecordingSurface::new()),
        )
        .unwrap();

        dispatcher.dispatch_delete(&DocumentRef::new("orders", "o1").unwrap());
        dispatcher.dispatch_create("products", &json!({"name": "Hat"}));

        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.stats().succeeded == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*store.written.lock(), vec!["products".to_string()]);

        // The held write still counts until it settles.
        let stats = dispatcher.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.in_flight(), 1);
        assert!(!dispatcher.wait_idle(Duration::from_millis(20)));

        release.send(()).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)));
        assert_eq!(
            *store.written.lock(),
            vec!["products".to_string(), "orders/o1".into()]
        );
        assert_eq!(dispatcher.stats().succeeded, 2);
    }

    #[test]
    fn test_failure_goes_to_surface_once() {
        let (open, _store, dispatcher, surface) = gated();

        dispatcher.dispatch_delete(&DocumentRef::new("orders", "o1").unwrap());
        open.send(Err(ErrorInfo::new(ErrorKind::PermissionDenied, "denied")))
            .unwrap();

        assert!(surface.wait_for(1, Duration::from_secs(5)));
        assert!(dispatcher.wait_idle(Duration::from_secs(5)));

        let notices = surface.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert!(notices[0].message.contains("orders/o1"));
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[test]
    fn test_absent_store_rejects_immediately() {
        let surface = Arc::new(RecordingSurface::new());
        let dispatcher =
            MutationDispatcher::new(DispatchConfig::default(), StoreSlot::empty(), surface.clone())
                .unwrap();

        dispatcher.dispatch_update(
            &DocumentRef::new("orders", "o1").unwrap(),
            &json!({"isCompleted": true}),
        );

        assert_eq!(surface.len(), 1);
        assert_eq!(surface.notices()[0].title, "Store unavailable");
        let stats = dispatcher.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.submitted, 0);
    }

    #[test]
    fn test_invalid_payload_is_reported() {
        let (_open, _store, dispatcher, surface) = gated();

        dispatcher.dispatch_create("products", &json!(["not", "an", "object"]));
        dispatcher.dispatch_create("products/p1", &json!({"name": "Hat"}));

        assert_eq!(surface.len(), 2);
        assert_eq!(dispatcher.stats().rejected, 2);
        assert_eq!(dispatcher.stats().submitted, 0);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let (open, store, dispatcher, _) = gated();

        dispatcher.dispatch_delete(&DocumentRef::new("orders", "o1").unwrap());
        dispatcher.dispatch_delete(&DocumentRef::new("orders", "o2").unwrap());
        open.send(Ok(())).unwrap();
        open.send(Ok(())).unwrap();

        dispatcher.shutdown();
        assert_eq!(store.written.lock().len(), 2);
    }
}
