//! Live-server checks.  Skipped unless `SCOPESTORE_TEST_REDIS_URL` points at a
//! disposable KeyDB / Redis instance, e.g. `redis://127.0.0.1:6379/15`.

use std::sync::Arc;

use serde_json::json;

use scopestore::{with_lock, Config, Endpoint, Layout, PoolRegistry, ScopedStore, Store, StoreError};

fn live_endpoint() -> Option<Endpoint> {
    let uri = std::env::var("SCOPESTORE_TEST_REDIS_URL").ok()?;
    Some(Endpoint::parse(&uri).expect("SCOPESTORE_TEST_REDIS_URL is not a valid endpoint"))
}

fn unique(name: &str) -> String {
    format!("scopestore-test-{name}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
async fn store_round_trip_on_live_server() {
    let Some(endpoint) = live_endpoint() else {
        eprintln!("SCOPESTORE_TEST_REDIS_URL not set; skipping");
        return;
    };

    for layout in [Layout::Hash, Layout::Prefixed] {
        let registry = PoolRegistry::redis(Config {
            layout,
            ..Config::default()
        })
        .unwrap();
        let store = ScopedStore::new(&registry, &endpoint, &unique("scope"));

        assert!(store.is_empty().await.unwrap());
        store.set("a", &json!({"nested": [1, 2]})).await.unwrap();
        store.set("nil", &serde_json::Value::Null).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"nested": [1, 2]})));
        assert_eq!(store.get("nil").await.unwrap(), Some(serde_json::Value::Null));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let read = store.multi_read(&["a", "missing"]).await.unwrap();
        assert_eq!(read.len(), 1);

        store.delete(&["a"]).await.unwrap();
        assert_eq!(store.keys().await.unwrap().len(), 1);
        store.clear().await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_serializes_live_writers() {
    let Some(endpoint) = live_endpoint() else {
        eprintln!("SCOPESTORE_TEST_REDIS_URL not set; skipping");
        return;
    };

    let registry = Arc::new(PoolRegistry::redis(Config::default()).unwrap());
    let store = ScopedStore::new(&registry, &endpoint, &unique("counter"));
    let lock_name = unique("lock");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let endpoint = endpoint.clone();
            let store = store.clone();
            let lock_name = lock_name.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    with_lock(&registry, &endpoint, &lock_name, |ctx| {
                        let store = store.pinned(&ctx);
                        async move {
                            let n = store.get_as::<i64>("n").await?.unwrap_or(0);
                            store.set_as("n", &(n + 1)).await
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

    assert_eq!(store.get_as::<i64>("n").await.unwrap(), Some(20));
    store.clear().await.unwrap();
}
