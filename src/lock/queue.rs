//! FIFO ticket-queue lock.
//!
//! Waiters append a random token to a list and poll its head.  The list
//! carries an expiry that is only armed when missing on enqueue and re-armed
//! on every release, so under steady use it never lapses, while a holder that
//! dies mid-hold stalls the queue for at most one window.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use super::Acquisition;
use crate::config::LockConfig;
use crate::engine::Connection;
use crate::error::StoreResult;
use crate::metrics::Metrics;

/// Queue our token and wait until it reaches the head, or the queue expires.
pub(crate) async fn acquire(
    connection: &dyn Connection,
    key: &str,
    token: &str,
    config: &LockConfig,
    metrics: &Metrics,
) -> StoreResult<Acquisition> {
    let position = connection
        .rpush_expire_nx(key, token, config.queue_expiry())
        .await?;
    debug!(%key, %token, position, "lock ticket queued");

    loop {
        match connection.lindex(key, 0).await? {
            Some(head) if head == token => {
                debug!(%key, %token, "lock acquired");
                return Ok(Acquisition::Head);
            }
            None => {
                // Our token went away with the whole list.  Entering is the
                // liveness side of the crash-recovery trade-off.
                warn!(%key, %token, "lock queue expired while waiting; entering without head position");
                metrics.lock_expired_entries.inc();
                return Ok(Acquisition::QueueExpired);
            }
            Some(head) => {
                trace!(%key, %head, "waiting for lock head");
                metrics.lock_polls.inc();
                tokio::time::sleep(poll_interval(
                    config.poll_min_micros,
                    config.poll_max_micros,
                ))
                .await;
            }
        }
    }
}

/// Pop the head and re-arm the expiry.
///
/// Skips the pop after an expired entry: the token left with the old list
/// and the current head belongs to someone else.
pub(crate) async fn release(
    connection: &dyn Connection,
    key: &str,
    token: &str,
    acquisition: Acquisition,
    expiry: Duration,
) -> StoreResult<()> {
    if acquisition == Acquisition::QueueExpired {
        debug!(%key, %token, "lock released without pop after expired entry");
        return Ok(());
    }

    match connection.lpop_expire(key, expiry).await? {
        Some(head) if head == token => debug!(%key, %token, "lock released"),
        Some(head) => warn!(
            %key,
            %token,
            popped = %head,
            "lock queue head was not ours; the hold outlived the queue expiry"
        ),
        None => warn!(%key, %token, "lock queue vanished before release"),
    }
    Ok(())
}

/// Uniform random sleep in `[min, max]` microseconds.
fn poll_interval(min_micros: u64, max_micros: u64) -> Duration {
    if min_micros >= max_micros {
        return Duration::from_micros(min_micros);
    }
    Duration::from_micros(rand::thread_rng().gen_range(min_micros..=max_micros))
}
