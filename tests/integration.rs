//! End-to-end behaviour of stores and locks on the in-process engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use scopestore::engine::MemoryConnector;
use scopestore::lock::lock_key;
use scopestore::{
    with_lock, Config, Endpoint, Layout, LockStrategy, PoolRegistry, ScopedStore, Store,
    StoreError,
};

fn endpoint() -> Endpoint {
    Endpoint::parse("redis://localhost:6379/8").unwrap()
}

fn setup(config: Config) -> (Arc<PoolRegistry>, Arc<MemoryConnector>) {
    let (registry, connector) = PoolRegistry::in_memory(config).unwrap();
    (Arc::new(registry), connector)
}

/// `workers` tasks each bump a shared counter `rounds` times under the lock.
async fn hammer_counter(registry: Arc<PoolRegistry>, workers: usize, rounds: usize) -> i64 {
    let store = ScopedStore::new(&registry, &endpoint(), "counters");
    store.clear().await.unwrap();

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..rounds {
                    with_lock(&registry, &endpoint(), "counter", |ctx| {
                        let store = store.pinned(&ctx);
                        async move {
                            let current = store.get_as::<i64>("hits").await?.unwrap_or(0);
                            tokio::task::yield_now().await;
                            store.set_as("hits", &(current + 1)).await
                        }
                    })
                    .await?;
                }
                Ok::<_, StoreError>(())
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    store.get_as::<i64>("hits").await.unwrap().unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holders_lose_no_updates() {
    let (registry, connector) = setup(Config::default());

    let total = hammer_counter(Arc::clone(&registry), 8, 5).await;

    assert_eq!(total, 40);
    let engine = connector.engine(&endpoint());
    assert!(!engine.exists(&lock_key("counter")));
    assert_eq!(registry.metrics().metrics.lock_acquisitions.get(), 40);
    assert_eq!(registry.metrics().metrics.lock_expired_entries.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_nx_holders_lose_no_updates() {
    let mut config = Config::default();
    config.lock.strategy = LockStrategy::SetNx;
    config.lock.retry_delay_ms = 2;
    config.lock.retry_jitter_ms = 2;
    let (registry, connector) = setup(config);

    let total = hammer_counter(registry, 4, 3).await;

    assert_eq!(total, 12);
    assert!(!connector.engine(&endpoint()).exists(&lock_key("counter")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_enter_in_arrival_order() {
    let config = Config {
        pool_size: 8,
        ..Config::default()
    };
    let (registry, connector) = setup(config);
    let engine = connector.engine(&endpoint());
    let key = lock_key("fifo");
    let order = Arc::new(Mutex::new(Vec::new()));
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move {
            with_lock(&registry, &endpoint(), "fifo", |_| async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
                Ok::<_, StoreError>(())
            })
            .await
        }
    });
    entered_rx.await.unwrap();

    let mut waiters = Vec::new();
    for id in 0..4usize {
        let registry = Arc::clone(&registry);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            with_lock(&registry, &endpoint(), "fifo", |_| async move {
                order.lock().unwrap().push(id);
                Ok::<_, StoreError>(())
            })
            .await
        }));
        // Wait until this waiter's ticket is in the queue before starting the next.
        while engine.list_snapshot(&key).len() < id + 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert!(!engine.exists(&key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_waiter_does_not_let_the_queue_behind_it_in_together() {
    let mut config = Config {
        pool_size: 8,
        ..Config::default()
    };
    config.lock.queue_expiry_secs = 1;
    let (registry, connector) = setup(config);
    let engine = connector.engine(&endpoint());
    let key = lock_key("L");
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

    let holder = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move {
            with_lock(&registry, &endpoint(), "L", |_| async move {
                let _ = entered_tx.send(());
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, StoreError>(())
            })
            .await
        }
    });
    entered_rx.await.unwrap();

    // Gives up while queued behind the holder.
    let gave_up = tokio::time::timeout(
        Duration::from_millis(20),
        with_lock(&registry, &endpoint(), "L", |_| async { Ok::<_, StoreError>(()) }),
    )
    .await;
    assert!(gave_up.is_err());

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tokio::spawn(async move {
                with_lock(&registry, &endpoint(), "L", |_| async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(())
                })
                .await
            })
        })
        .collect();

    holder.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(registry.metrics().metrics.lock_expired_entries.get(), 0);
    assert!(!engine.exists(&key));
}

#[tokio::test]
async fn example_session() {
    for layout in [Layout::Hash, Layout::Prefixed] {
        let (registry, _) = setup(Config {
            layout,
            ..Config::default()
        });
        let store = ScopedStore::new(&registry, &endpoint(), "foobar");

        store.clear().await.unwrap();
        store.set("foobar", &json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("foobar").await.unwrap(), Some(json!({"a": 1})));

        let entries: HashMap<String, serde_json::Value> =
            serde_json::from_value(json!({"foobar": 1, "baz": 2, "blah": 4})).unwrap();
        store.merge(&entries).await.unwrap();
        let read = store
            .multi_read(&["foobar", "baz", "blah", "fake"])
            .await
            .unwrap();
        assert_eq!(read, entries);

        store.delete(&["baz", "blah"]).await.unwrap();
        assert_eq!(store.keys().await.unwrap().len(), 1);
        store.clear().await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }
}

#[tokio::test]
async fn stores_work_as_trait_objects() {
    let (registry, _) = setup(Config::default());
    let stores: Vec<Box<dyn Store>> = vec![
        Box::new(ScopedStore::new(&registry, &endpoint(), "one")),
        Box::new(ScopedStore::new(&registry, &endpoint(), "two")),
    ];
    for (i, store) in stores.iter().enumerate() {
        store.set("n", &json!(i)).await.unwrap();
    }
    assert_eq!(stores[0].get("n").await.unwrap(), Some(json!(0)));
    assert_eq!(stores[1].get("n").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn endpoints_are_separate_engines() {
    let (registry, _) = setup(Config::default());
    let a = ScopedStore::new(&registry, &Endpoint::parse("redis://host-a").unwrap(), "s");
    let b = ScopedStore::new(&registry, &Endpoint::parse("redis://host-b").unwrap(), "s");

    a.set("k", &json!("a")).await.unwrap();
    assert_eq!(b.get("k").await.unwrap(), None);
    assert_eq!(registry.pool_count(), 2);
}

#[tokio::test]
async fn metrics_render_after_activity() {
    let (registry, _) = setup(Config::default());
    let store = ScopedStore::new(&registry, &endpoint(), "m");
    store.set("k", &json!(1)).await.unwrap();
    let _: Result<(), StoreError> =
        with_lock(&registry, &endpoint(), "m", |_| async { Ok(()) }).await;

    let text = registry.metrics().encode();
    assert!(text.contains("scopestore_lock_acquisitions_total 1"));
    assert!(text.contains("operation=\"Set\""));
}
