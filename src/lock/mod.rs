//! Cross-process mutual exclusion on the shared engine.
//!
//! [`with_lock`] runs a closure while holding a named lock.  The connection
//! used for the lock's own commands is handed to the closure as a
//! [`LockContext`]; stores bound to it with
//! [`ScopedStore::pinned`](crate::store::ScopedStore::pinned) run on that same
//! connection, so a body never competes with its own lock for a pool slot.
//!
//! # Expiry bound
//!
//! With the default queue strategy the lock queue expires after
//! `lock.queue_expiry_secs` without a release.  A body that runs longer than
//! that window can be joined by a waiter that sees the queue gone and enters.
//! Keep the window well above the longest expected hold.  The `set-nx`
//! strategy has the same bound with `lock.ttl_ms`.

mod queue;
mod setnx;
mod ticket;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::config::LockStrategy;
use crate::endpoint::Endpoint;
use crate::engine::Connection;
use crate::error::StoreError;
use crate::pool::PoolRegistry;
use ticket::Ticket;

/// Prefix of the engine key holding a lock's queue or owner.
pub const LOCK_KEY_PREFIX: &str = "scopestore-lock-";

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{name}")
}

/// How the caller came to hold the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Our token reached the head of the queue (or our SET NX won).
    Head,
    /// The queue expired while we waited; entry was granted without
    /// exclusivity guarantees.
    QueueExpired,
}

/// The held lock, as seen from inside the guarded body.
#[derive(Clone)]
pub struct LockContext {
    connection: Arc<dyn Connection>,
    name: String,
    token: String,
    acquisition: Acquisition,
}

impl LockContext {
    /// The connection the lock was taken on.  Valid for the body's duration.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This holder's waiter token.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquisition(&self) -> Acquisition {
        self.acquisition
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("acquisition", &self.acquisition)
            .finish()
    }
}

/// Run `body` while holding the lock `name` on `endpoint`.
///
/// Waits without a deadline; wrap the call in `tokio::time::timeout` when one
/// is needed.  Release runs whether the body returns `Ok`, `Err` or panics;
/// a body error wins over a release error, which is then only logged.
/// Dropping the returned future at any point, while waiting or inside the
/// body, withdraws this caller's token in a background task so the waiters
/// queued behind it move on.
pub async fn with_lock<F, Fut, T, E>(
    registry: &PoolRegistry,
    endpoint: &Endpoint,
    name: &str,
    body: F,
) -> Result<T, E>
where
    F: FnOnce(LockContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    let settings = &registry.config().lock;
    let metrics = &registry.metrics().metrics;
    let expiry = match settings.strategy {
        LockStrategy::Queue => settings.queue_expiry(),
        LockStrategy::SetNx => settings.ttl(),
    };

    let connection = registry.pool_for(endpoint).checkout().await?;
    let ticket = Ticket::new(
        connection,
        lock_key(name),
        uuid::Uuid::new_v4().to_string(),
        settings.strategy,
        expiry,
    );
    let (key, token) = (ticket.key(), ticket.token());

    let acquisition = match settings.strategy {
        LockStrategy::Queue => {
            queue::acquire(ticket.connection(), key, token, settings, metrics).await?
        }
        LockStrategy::SetNx => {
            setnx::acquire(ticket.connection(), key, token, settings, metrics).await?;
            Acquisition::Head
        }
    };
    metrics.lock_acquisitions.inc();

    let ctx = LockContext {
        connection: ticket.share(),
        name: name.to_string(),
        token: token.to_string(),
        acquisition,
    };

    let started = Instant::now();
    let outcome = AssertUnwindSafe(async move { body(ctx).await })
        .catch_unwind()
        .await;
    let held = started.elapsed();
    metrics.lock_hold_seconds.observe(held.as_secs_f64());

    let released = match settings.strategy {
        LockStrategy::Queue => {
            queue::release(ticket.connection(), key, token, acquisition, expiry).await
        }
        LockStrategy::SetNx => setnx::release(ticket.connection(), key, token).await,
    };
    ticket.finish();
    debug!(%endpoint, %name, held_ms = held.as_millis() as u64, "lock hold finished");

    match outcome {
        Err(panic) => {
            if let Err(e) = released {
                warn!(error = %e, %name, "lock release failed after body panic");
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(body_err)) => {
            if let Err(e) = released {
                warn!(error = %e, %name, "lock release failed after body error");
            }
            Err(body_err)
        }
        Ok(Ok(value)) => {
            released?;
            Ok(value)
        }
    }
}
