//! End-to-end tests for the sync layer over an in-process store.

use docsync::models::{Order, Product, ORDERS, PRODUCTS};
use docsync::{
    DocumentRef, Filter, MemoryStore, NoticeLevel, OrderBy, QueryDescriptor, QueryResult,
    RecordingSurface, Snapshot, StoreHandle, SyncConfig, SyncContext,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_context(store: &MemoryStore) -> (SyncContext, Arc<RecordingSurface>) {
    init_tracing();
    let surface = Arc::new(RecordingSurface::new());
    let ctx = SyncContext::with_store(
        SyncConfig::default(),
        StoreHandle::new(store.clone()),
        surface.clone(),
    )
    .unwrap();
    (ctx, surface)
}

fn names(result: &QueryResult) -> Vec<String> {
    result
        .data
        .as_ref()
        .and_then(|s| s.records())
        .map(|docs| {
            docs.iter()
                .filter_map(|d| d.get("name").and_then(|v| v.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// --- End-to-end Scenarios ---

#[test]
fn test_two_consumers_share_one_channel() {
    let store = MemoryStore::new();
    let (ctx, _) = test_context(&store);

    let first = ctx.observe(QueryDescriptor::collection(PRODUCTS));
    let second = ctx.observe(QueryDescriptor::collection(PRODUCTS));
    assert_eq!(store.stats().subscribe_calls, 1);

    store.seed(PRODUCTS, "p1", json!({"name": "Shirt"})).unwrap();

    let a = first.wait_until(WAIT, |r| names(r) == ["Shirt"]).unwrap();
    let b = second.wait_until(WAIT, |r| names(r) == ["Shirt"]).unwrap();
    assert_eq!(a, b);

    let records = first.result().data.unwrap();
    let doc = &records.records().unwrap()[0];
    assert_eq!(doc.id, "p1");
    assert_eq!(doc.get("name"), Some(&json!("Shirt")));

    // Both consumers hold the very same snapshot value.
    assert!(Arc::ptr_eq(
        &first.result().data.unwrap(),
        &second.result().data.unwrap()
    ));
}

#[test]
fn test_create_returns_before_write_completes() {
    let store = MemoryStore::new();
    let (ctx, surface) = test_context(&store);

    let first = ctx.observe(QueryDescriptor::collection(PRODUCTS));
    let second = ctx.observe(QueryDescriptor::collection(PRODUCTS));
    assert!(names(&first.result()).is_empty());

    store.set_write_delay(Duration::from_millis(200));
    let started = Instant::now();
    ctx.dispatch_create(PRODUCTS, &json!({"name": "Hat"}));
    assert!(started.elapsed() < Duration::from_millis(100));

    // Nothing has landed yet.
    assert!(names(&first.result()).is_empty());

    let a = first.wait_until(WAIT, |r| names(r) == ["Hat"]).unwrap();
    let b = second.wait_until(WAIT, |r| names(r) == ["Hat"]).unwrap();
    assert_eq!(a, b);
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert!(ctx.dispatcher().wait_idle(WAIT));
    assert_eq!(ctx.dispatcher().stats().succeeded, 1);
    assert!(surface.is_empty());
}

#[test]
fn test_rejected_delete_keeps_cached_snapshot() {
    let store = MemoryStore::new();
    store
        .seed(ORDERS, "o1", json!({"customerName": "Asha", "isCompleted": false}))
        .unwrap();
    let (ctx, surface) = test_context(&store);

    let orders = ctx.observe(QueryDescriptor::collection(ORDERS));
    let before = orders.result();
    assert_eq!(before.data.as_ref().unwrap().len(), 1);

    store.fail_writes(Some(docsync::ErrorInfo::new(
        docsync::ErrorKind::PermissionDenied,
        "insufficient permissions",
    )));
    ctx.dispatch_delete(&DocumentRef::new(ORDERS, "o1").unwrap());

    assert!(surface.wait_for(1, WAIT));
    assert!(ctx.dispatcher().wait_idle(WAIT));

    let notices = surface.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].title, "Delete failed");
    assert!(notices[0].message.contains("orders/o1"));

    assert_eq!(orders.result(), before);
    assert!(store.document(ORDERS, "o1").is_some());
}

#[test]
fn test_switching_documents_moves_channel() {
    let store = MemoryStore::new();
    store.seed(PRODUCTS, "p1", json!({"name": "Shirt"})).unwrap();
    store.seed(PRODUCTS, "p2", json!({"name": "Hat"})).unwrap();
    let (ctx, _) = test_context(&store);

    let mut observer = ctx.observe(QueryDescriptor::document(PRODUCTS, "p1"));
    let p1_key = docsync::identity_of(
        &QueryDescriptor::document(PRODUCTS, "p1"),
        &ctx.store().unwrap(),
    )
    .unwrap();
    assert_eq!(ctx.subscriptions().refcount(&p1_key), 1);
    assert_eq!(
        observer.result().data.unwrap().document().map(|d| d.id.clone()),
        Some("p1".to_string())
    );

    observer.set_query(Some(QueryDescriptor::document(PRODUCTS, "p2")));

    assert_eq!(ctx.subscriptions().refcount(&p1_key), 0);
    let stats = store.stats();
    assert_eq!(stats.subscribe_calls, 2);
    assert_eq!(stats.unsubscribe_calls, 1);
    assert_eq!(stats.active_listeners, 1);

    // A write to p1 after the switch never reaches this observer.
    store.seed(PRODUCTS, "p1", json!({"name": "Shirt v2"})).unwrap();
    while let Some(update) = observer.try_recv() {
        if let Some(data) = update.data {
            assert_eq!(data.document().map(|d| d.id.as_str()), Some("p2"));
        }
    }

    let result = observer.result();
    let doc = result.data.as_ref().and_then(|s| s.document()).unwrap();
    assert_eq!(doc.id, "p2");
    assert_eq!(doc.get("name"), Some(&json!("Hat")));
}

#[test]
fn test_no_store_observe_is_idle() {
    init_tracing();
    let surface = Arc::new(RecordingSurface::new());
    let ctx = SyncContext::new(SyncConfig::default(), surface.clone()).unwrap();

    let started = Instant::now();
    let observer = ctx.observe(QueryDescriptor::collection(PRODUCTS));
    let result = observer.result();
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(result.data.is_none());
    assert!(!result.is_loading);
    assert!(result.error.is_none());
    assert!(!observer.is_attached());
    assert_eq!(ctx.subscriptions().stats().channels_opened, 0);
    assert!(surface.is_empty());
}

// --- Realistic Workflow Tests ---

#[test]
fn test_admin_adds_product_with_reserved_id() {
    let store = MemoryStore::new();
    let (ctx, surface) = test_context(&store);

    let catalog = ctx.observe(QueryDescriptor::collection(PRODUCTS));

    let doc = ctx.reserve_document(PRODUCTS).unwrap();
    let product = Product::listing(
        &doc.id,
        "Cool T-Shirt",
        "Soft cotton tee",
        1299.0,
        "https://images.example/tee.jpg",
        "S, M, L",
    );
    ctx.dispatch_set(&doc, &product, false);

    catalog
        .wait_until(WAIT, |r| r.data.as_ref().map_or(false, |s| s.len() == 1))
        .unwrap();

    let decoded = catalog.result_as::<Product>().unwrap().data.unwrap();
    let stored = &decoded.records().unwrap()[0];
    assert_eq!(stored.id, doc.id.as_str());
    assert_eq!(stored.price_formatted, "₹1,299");
    assert_eq!(stored.images[0].id, format!("{}_img", doc.id));
    assert_eq!(stored.sizes, vec!["S", "M", "L"]);
    assert!(surface.is_empty());
}

#[test]
fn test_order_completion_toggle() {
    let store = MemoryStore::new();
    store
        .seed(
            ORDERS,
            "o1",
            json!({
                "productId": "p1",
                "customerName": "Asha",
                "customerContact": "9800000010",
                "customerAddress": "Pune",
                "orderDate": "2025-10-31T10:00:00Z",
                "isCompleted": false
            }),
        )
        .unwrap();
    let (ctx, _) = test_context(&store);

    let pending = ctx.observe(
        QueryDescriptor::collection(ORDERS).filter(Filter::equals("isCompleted", false)),
    );
    let completed = ctx.observe(
        QueryDescriptor::collection(ORDERS).filter(Filter::equals("isCompleted", true)),
    );
    assert_eq!(pending.result().data.unwrap().len(), 1);
    assert_eq!(completed.result().data.unwrap().len(), 0);

    let order = DocumentRef::new(ORDERS, "o1").unwrap();
    ctx.dispatch_update(&order, &Order::completion_patch("2025-11-01T09:00:00Z"));

    completed
        .wait_until(WAIT, |r| r.data.as_ref().map_or(false, |s| s.len() == 1))
        .unwrap();
    pending
        .wait_until(WAIT, |r| r.data.as_ref().map_or(false, |s| s.is_empty()))
        .unwrap();

    let done = completed.result_as::<Order>().unwrap().data.unwrap();
    let done = &done.records().unwrap()[0];
    assert!(done.is_completed);
    assert_eq!(done.completed_date.as_deref(), Some("2025-11-01T09:00:00Z"));

    ctx.dispatch_update(&order, &Order::reopen_patch());
    pending
        .wait_until(WAIT, |r| r.data.as_ref().map_or(false, |s| s.len() == 1))
        .unwrap();
}

#[test]
fn test_ordered_limited_listing() {
    let store = MemoryStore::new();
    let catalog = [
        ("a", "Cap", 299),
        ("b", "Coat", 4999),
        ("c", "Tee", 799),
        ("d", "Sock", 99),
    ];
    for (id, name, price) in catalog {
        store
            .seed(PRODUCTS, id, json!({"name": name, "price": price}))
            .unwrap();
    }
    let (ctx, _) = test_context(&store);

    let priciest = ctx.observe(
        QueryDescriptor::collection(PRODUCTS)
            .order_by(OrderBy::desc("price"))
            .limit(2),
    );
    assert_eq!(names(&priciest.result()), ["Coat", "Tee"]);

    ctx.dispatch_delete(&DocumentRef::new(PRODUCTS, "b").unwrap());
    let result = priciest
        .wait_until(WAIT, |r| names(r) == ["Tee", "Cap"])
        .unwrap();
    assert!(matches!(result.data.as_deref(), Some(Snapshot::Collection(_))));
}

#[test]
fn test_shutdown_drains_queued_writes() {
    let store = MemoryStore::new();
    let (ctx, _) = test_context(&store);

    store.set_write_delay(Duration::from_millis(10));
    for i in 0..5 {
        ctx.dispatch_create(PRODUCTS, &json!({"name": format!("Item {}", i)}));
    }
    ctx.shutdown();

    assert_eq!(store.documents(PRODUCTS).len(), 5);
    assert_eq!(store.stats().write_calls, 5);
}
