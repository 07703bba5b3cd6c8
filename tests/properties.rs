//! Property tests for query identity and subscription reference counting.

use docsync::{
    identity_of, Filter, FilterOp, MemoryStore, OrderBy, QueryDescriptor, StoreHandle,
    SubscriptionConfig, SubscriptionManager, SyncConfig, SyncContext, TracingSurface,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn filter_strategy() -> impl Strategy<Value = Filter> {
    let op = prop_oneof![
        Just(FilterOp::Equal),
        Just(FilterOp::NotEqual),
        Just(FilterOp::Less),
        Just(FilterOp::GreaterOrEqual),
    ];
    ("[a-c]{1,3}", op, -5i64..5).prop_map(|(field, op, value)| Filter::new(field, op, value))
}

fn manager() -> SubscriptionManager {
    SubscriptionManager::new(SubscriptionConfig::default(), Arc::new(TracingSurface))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_filter_order_does_not_change_identity(
        filters in prop::collection::vec(filter_strategy(), 0..6),
        seed in any::<u64>(),
    ) {
        let store = StoreHandle::new(MemoryStore::new());

        let mut shuffled = filters.clone();
        // Deterministic rotation plus a duplicated element.
        if !shuffled.is_empty() {
            let n = shuffled.len();
            shuffled.rotate_left((seed as usize) % n);
            shuffled.push(shuffled[(seed as usize / 7) % n].clone());
        }

        let build = |fs: &[Filter]| {
            fs.iter().cloned().fold(
                QueryDescriptor::collection("products").order_by(OrderBy::asc("price")),
                |d, f| d.filter(f),
            )
        };

        let a = identity_of(&build(&filters), &store).unwrap();
        let b = identity_of(&build(&shuffled), &store).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_same_query_on_other_store_is_distinct(collection in "[a-z]{1,8}") {
        let first = StoreHandle::new(MemoryStore::new());
        let second = StoreHandle::new(MemoryStore::new());
        let descriptor = QueryDescriptor::collection(collection);

        let a = identity_of(&descriptor, &first).unwrap();
        let b = identity_of(&descriptor, &second).unwrap();
        prop_assert_ne!(&a, &b);
        prop_assert_eq!(a.query, b.query);
    }

    #[test]
    fn test_refcount_teardown_in_any_order(
        order in (1usize..12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let store = MemoryStore::new();
        let handle = StoreHandle::new(store.clone());
        let manager = manager();
        let key = identity_of(&QueryDescriptor::collection("orders"), &handle).unwrap();

        let mut attachments: Vec<_> = order
            .iter()
            .map(|_| Some(manager.attach(key.clone(), &handle)))
            .collect();
        prop_assert_eq!(store.stats().subscribe_calls, 1);
        prop_assert_eq!(manager.refcount(&key), order.len());

        for (i, &idx) in order.iter().enumerate() {
            prop_assert_eq!(store.stats().unsubscribe_calls, 0);
            let attachment = attachments[idx].take().unwrap();
            attachment.detach();
            prop_assert_eq!(manager.refcount(&key), order.len() - i - 1);
        }

        prop_assert_eq!(store.stats().unsubscribe_calls, 1);
        prop_assert_eq!(store.stats().active_listeners, 0);
        let stats = manager.stats();
        prop_assert_eq!(stats.channels_opened, 1);
        prop_assert_eq!(stats.channels_closed, 1);
    }

    #[test]
    fn test_equal_queries_share_snapshots(consumers in 2usize..8, docs in 0usize..5) {
        let store = MemoryStore::new();
        for i in 0..docs {
            store.seed("products", &format!("p{}", i), json!({"n": i})).unwrap();
        }
        let handle = StoreHandle::new(store.clone());
        let manager = manager();

        let attachments: Vec<_> = (0..consumers)
            .map(|_| {
                // Rebuilt descriptor each time.
                let descriptor = QueryDescriptor::collection("products")
                    .filter(Filter::new("n", FilterOp::GreaterOrEqual, 0));
                let key = identity_of(&descriptor, &handle).unwrap();
                manager.attach(key, &handle)
            })
            .collect();

        prop_assert_eq!(store.stats().subscribe_calls, 1);
        let first = attachments[0].result();
        prop_assert_eq!(first.data.as_ref().map(|s| s.len()), Some(docs));
        for attachment in &attachments[1..] {
            prop_assert_eq!(attachment.result(), first.clone());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_dispatch_never_waits_for_write(delay_ms in 0u64..60) {
        let store = MemoryStore::new();
        store.set_write_delay(Duration::from_millis(delay_ms));
        let handle = StoreHandle::new(store.clone());
        let ctx = SyncContext::headless(SyncConfig::default(), Some(handle)).unwrap();

        let started = Instant::now();
        ctx.dispatch_create("products", &json!({"name": "Hat"}));
        let p1 = docsync::DocumentRef::new("products", "p1").unwrap();
        ctx.dispatch_update(&p1, &json!({"x": 1}));
        ctx.dispatch_delete(&p1);
        let elapsed = started.elapsed();

        // Waiting on even one write would take at least `delay_ms`.
        if delay_ms >= 40 {
            prop_assert!(elapsed < Duration::from_millis(delay_ms));
        }
        prop_assert!(ctx.dispatcher().wait_idle(Duration::from_secs(5)));
        prop_assert_eq!(ctx.dispatcher().stats().submitted, 3);
    }
}
