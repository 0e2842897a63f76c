//! Bounded, exclusively checked-out connection pools.
//!
//! A [`ConnectionPool`] owns up to `size` connections to one endpoint.  A
//! checkout waits for a semaphore permit, reuses an idle connection or opens a
//! new one, and hands back a [`PooledConnection`] guard that returns the
//! connection on drop, whichever way the caller exits.

pub mod registry;

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::engine::{Connection, Connector};
use crate::error::{StoreError, StoreResult};
use crate::metrics::Metrics;

pub use registry::PoolRegistry;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub open: usize,
    pub idle: usize,
}

struct Slots {
    idle: Vec<Arc<dyn Connection>>,
    open: usize,
    closed: bool,
}

pub struct ConnectionPool {
    endpoint: Endpoint,
    size: usize,
    checkout_timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    slots: Arc<Mutex<Slots>>,
    metrics: Arc<Metrics>,
}

impl ConnectionPool {
    pub fn new(
        endpoint: Endpoint,
        size: usize,
        checkout_timeout: Option<Duration>,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let size = size.max(1);
        Self {
            endpoint,
            size,
            checkout_timeout,
            connector,
            permits: Arc::new(Semaphore::new(size)),
            slots: Arc::new(Mutex::new(Slots {
                idle: Vec::with_capacity(size),
                open: 0,
                closed: false,
            })),
            metrics,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        PoolStatus {
            size: self.size,
            open: slots.open,
            idle: slots.idle.len(),
        }
    }

    /// Quit every idle connection.  Connections still checked out are quit
    /// when their guard drops.  A closed pool keeps serving checkouts, but
    /// each connection it opens is quit on return.
    pub async fn close(&self) {
        let idle = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.closed = true;
            let idle = std::mem::take(&mut slots.idle);
            slots.open -= idle.len();
            idle
        };
        self.metrics.pool_connections_open.dec_by(idle.len() as i64);
        debug!(endpoint = %self.endpoint, closed = idle.len(), "pool closed");
        for connection in idle {
            if let Err(e) = connection.quit().await {
                warn!(endpoint = %self.endpoint, error = %e, "failed to quit pooled connection");
            }
        }
    }

    /// Borrow a connection, waiting while all of them are checked out.
    pub async fn checkout(&self) -> StoreResult<PooledConnection> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match self.checkout_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                StoreError::Connection(format!(
                    "pool for {} exhausted: no connection free after {timeout:?}",
                    self.endpoint
                ))
            })?,
            None => acquire.await,
        }
        .map_err(|_| StoreError::Connection(format!("pool for {} is closed", self.endpoint)))?;

        let idle = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .idle
            .pop();

        let connection = match idle {
            Some(connection) => connection,
            None => {
                // The permit is dropped on error, freeing the slot.
                let connection = self.connector.connect(&self.endpoint).await?;
                self.slots
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .open += 1;
                self.metrics.pool_connections_open.inc();
                debug!(endpoint = %self.endpoint, size = self.size, "pool connection opened");
                connection
            }
        };

        self.metrics.pool_checkouts.inc();
        trace!(endpoint = %self.endpoint, "connection checked out");

        Ok(PooledConnection {
            connection,
            slots: Arc::clone(&self.slots),
            metrics: Arc::clone(&self.metrics),
            _permit: permit,
        })
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

/// An exclusively borrowed connection; returned to its pool on drop.
pub struct PooledConnection {
    connection: Arc<dyn Connection>,
    slots: Arc<Mutex<Slots>>,
    metrics: Arc<Metrics>,
    // Released after the connection is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// A shared handle to the same connection, for threading into a lock body.
    pub fn share(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.closed {
            slots.idle.push(Arc::clone(&self.connection));
            return;
        }
        slots.open -= 1;
        drop(slots);
        self.metrics.pool_connections_open.dec();

        let connection = Arc::clone(&self.connection);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = connection.quit().await {
                    warn!(error = %e, "failed to quit connection returned to a closed pool");
                }
            });
        }
    }
}
