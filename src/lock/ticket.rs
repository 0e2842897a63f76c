//! Cleanup for lock calls that never reach their release.
//!
//! A [`Ticket`] owns the lock connection from before the enqueue until the
//! release has completed.  Dropping it earlier (a cancelled `with_lock`
//! future, an error while polling) spawns a task that takes our token back
//! out of the engine, so waiters behind it are not left stuck until the
//! queue expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::LockStrategy;
use crate::engine::Connection;
use crate::pool::PooledConnection;

pub(crate) struct Ticket {
    connection: Arc<dyn Connection>,
    // Holds the pool slot; `None` once the release has completed.
    slot: Option<PooledConnection>,
    key: String,
    token: String,
    strategy: LockStrategy,
    expiry: Duration,
}

impl Ticket {
    pub(crate) fn new(
        connection: PooledConnection,
        key: String,
        token: String,
        strategy: LockStrategy,
        expiry: Duration,
    ) -> Self {
        Self {
            connection: connection.share(),
            slot: Some(connection),
            key,
            token,
            strategy,
            expiry,
        }
    }

    pub(crate) fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub(crate) fn share(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// The release ran to completion; hand the connection back to the pool.
    pub(crate) fn finish(mut self) {
        self.slot.take();
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%key, %token, "lock abandoned outside a runtime; ticket left until it expires");
            return;
        };

        let strategy = self.strategy;
        let expiry = self.expiry;
        handle.spawn(async move {
            let outcome = withdraw(&*connection, &key, &token, strategy, expiry).await;
            match outcome {
                Ok(removed) => debug!(%key, %token, removed, "abandoned lock ticket withdrawn"),
                Err(e) => warn!(%key, %token, error = %e, "failed to withdraw abandoned lock ticket"),
            }
            drop(slot);
        });
    }
}

/// Remove every trace of `token`, whether it was still waiting or held.
///
/// LREM takes the token out wherever it sits; when it was the head that is
/// the same as the regular pop.  A token that is already gone matches
/// nothing, so this never evicts another waiter.
async fn withdraw(
    connection: &dyn Connection,
    key: &str,
    token: &str,
    strategy: LockStrategy,
    expiry: Duration,
) -> crate::error::StoreResult<bool> {
    match strategy {
        LockStrategy::Queue => Ok(connection.lrem_expire(key, token, expiry).await? > 0),
        LockStrategy::SetNx => connection.del_if_prefixed(key, &format!("{token}:")).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::engine::{MemoryConnector, MemoryEngine};
    use crate::metrics::MetricsRegistry;
    use crate::pool::ConnectionPool;

    async fn checkout() -> (PooledConnection, Arc<MemoryEngine>, Arc<ConnectionPool>) {
        let connector = Arc::new(MemoryConnector::new());
        let endpoint = Endpoint::parse("redis://ticket:6379").unwrap();
        let engine = connector.engine(&endpoint);
        let pool = Arc::new(ConnectionPool::new(
            endpoint,
            1,
            None,
            connector,
            MetricsRegistry::new().metrics,
        ));
        (pool.checkout().await.unwrap(), engine, pool)
    }

    async fn settle(engine: &MemoryEngine, key: &str, expected: &[&str]) {
        for _ in 0..200 {
            if engine.list_snapshot(key) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(engine.list_snapshot(key), expected);
    }

    #[tokio::test]
    async fn dropped_ticket_leaves_the_queue() {
        let (connection, engine, pool) = checkout().await;
        let expiry = Duration::from_secs(10);
        for token in ["holder", "mine", "next"] {
            engine.rpush_expire_nx("q", token, expiry).await.unwrap();
        }

        drop(Ticket::new(connection, "q".into(), "mine".into(), LockStrategy::Queue, expiry));

        settle(&engine, "q", &["holder", "next"]).await;
        // The connection is back once the cleanup finished.
        pool.checkout().await.unwrap();
    }

    #[tokio::test]
    async fn finished_ticket_sends_nothing() {
        let (connection, engine, _pool) = checkout().await;
        let expiry = Duration::from_secs(10);
        engine.rpush_expire_nx("q", "mine", expiry).await.unwrap();
        let before = engine.command_count();

        Ticket::new(connection, "q".into(), "mine".into(), LockStrategy::Queue, expiry).finish();
        tokio::task::yield_now().await;

        assert_eq!(engine.command_count(), before);
        assert_eq!(engine.list_snapshot("q"), vec!["mine".to_string()]);
    }

    #[tokio::test]
    async fn dropped_set_nx_ticket_releases_only_its_own_key() {
        let (connection, engine, _pool) = checkout().await;
        engine
            .set_nx_px("l", "someone:1", Duration::from_secs(5))
            .await
            .unwrap();

        drop(Ticket::new(
            connection,
            "l".into(),
            "mine".into(),
            LockStrategy::SetNx,
            Duration::from_secs(5),
        ));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(engine.exists("l"));
    }
}
