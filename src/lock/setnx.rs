use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::engine::Connection;
use crate::error::StoreResult;
use crate::metrics::Metrics;

/// Acquire a single-key lock using SET NX PX, retrying until it is ours.
///
/// Each round makes up to `retry_count` attempts spaced by
/// `retry_delay ± retry_jitter`; between rounds the waiter backs off for a
/// random 1–90 ms.  The stored value is `{token}:{unix_ts}` so release can
/// check ownership.
pub(crate) async fn acquire(
    connection: &dyn Connection,
    key: &str,
    token: &str,
    config: &LockConfig,
    metrics: &Metrics,
) -> StoreResult<()> {
    let value = format!("{token}:{}", chrono::Utc::now().timestamp());
    let attempts = config.retry_count.max(1);

    loop {
        for attempt in 1..=attempts {
            if connection.set_nx_px(key, &value, config.ttl()).await? {
                debug!(%key, %token, attempt, "lock acquired");
                return Ok(());
            }
            metrics.lock_polls.inc();
            if attempt < attempts {
                tokio::time::sleep(retry_delay(config.retry_delay_ms, config.retry_jitter_ms))
                    .await;
            }
        }
        trace!(%key, %token, "lock busy; backing off");
        tokio::time::sleep(round_backoff()).await;
    }
}

/// Release the lock only if it is still owned by `token`.
///
/// The check-and-delete runs as one script on the engine.  A key that
/// expired (or was taken over) after the TTL is left alone.
pub(crate) async fn release(connection: &dyn Connection, key: &str, token: &str) -> StoreResult<()> {
    let released = connection
        .del_if_prefixed(key, &format!("{token}:"))
        .await?;
    if released {
        debug!(%key, %token, "lock released");
    } else {
        warn!(%key, %token, "lock release: key missing or owned by another holder");
    }
    Ok(())
}

fn retry_delay(delay_ms: u64, jitter_ms: u64) -> Duration {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ms)
    };
    Duration::from_millis(delay_ms + jitter)
}

fn round_backoff() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1..=90))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::metrics::MetricsRegistry;

    #[test]
    fn retry_delay_adds_bounded_jitter() {
        for _ in 0..100 {
            let d = retry_delay(100, 10);
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(110));
        }
        assert_eq!(retry_delay(43, 0), Duration::from_millis(43));
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let engine = MemoryEngine::new();
        let metrics = MetricsRegistry::new();
        let config = LockConfig::default();

        acquire(&engine, "l", "tok", &config, &metrics.metrics)
            .await
            .unwrap();
        assert!(engine.exists("l"));

        release(&engine, "l", "other").await.unwrap();
        assert!(engine.exists("l"), "foreign token must not release");

        release(&engine, "l", "tok").await.unwrap();
        assert!(!engine.exists("l"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_ttl_of_abandoned_lock() {
        let engine = MemoryEngine::new();
        let metrics = MetricsRegistry::new();
        let config = LockConfig {
            ttl_ms: 1_000,
            retry_count: 2,
            retry_delay_ms: 50,
            retry_jitter_ms: 5,
            ..LockConfig::default()
        };

        assert!(engine
            .set_nx_px("l", "ghost:0", config.ttl())
            .await
            .unwrap());

        let started = tokio::time::Instant::now();
        acquire(&engine, "l", "tok", &config, &metrics.metrics)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(metrics.metrics.lock_polls.get() >= 2);
    }
}
