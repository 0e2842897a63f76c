//! Per-endpoint pool registry.
//!
//! The registry is created once at startup and passed by reference to every
//! store and lock call.  It also carries the process-wide choices that must
//! agree across all of them: serializer, storage layout, lock settings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use super::ConnectionPool;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::engine::{Connector, FredConnector, MemoryConnector};
use crate::error::StoreResult;
use crate::metrics::MetricsRegistry;
use crate::serializer::{serializer_by_name, Serializer};

pub struct PoolRegistry {
    config: Config,
    connector: Arc<dyn Connector>,
    serializer: Arc<dyn Serializer>,
    metrics: MetricsRegistry,
    pools: Mutex<HashMap<Endpoint, Arc<ConnectionPool>>>,
}

impl PoolRegistry {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> StoreResult<Self> {
        let serializer = serializer_by_name(&config.serializer)?;
        Ok(Self {
            config,
            connector,
            serializer,
            metrics: MetricsRegistry::new(),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Registry whose pools talk to real KeyDB / Redis servers.
    pub fn redis(config: Config) -> StoreResult<Self> {
        Self::new(config, Arc::new(FredConnector))
    }

    /// Registry backed by in-process engines, one per endpoint.
    pub fn in_memory(config: Config) -> StoreResult<(Self, Arc<MemoryConnector>)> {
        let connector = Arc::new(MemoryConnector::new());
        let registry = Self::new(config, connector.clone())?;
        Ok((registry, connector))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The pool for `endpoint`, created on first use.
    pub fn pool_for(&self, endpoint: &Endpoint) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(endpoint) {
            return Arc::clone(pool);
        }

        let pool = Arc::new(ConnectionPool::new(
            endpoint.clone(),
            self.config.pool_size,
            self.config.checkout_timeout(),
            Arc::clone(&self.connector),
            Arc::clone(&self.metrics.metrics),
        ));
        pools.insert(endpoint.clone(), Arc::clone(&pool));
        info!(%endpoint, pool_size = self.config.pool_size, "connection pool created");
        pool
    }

    /// Forget every pool so the next call reconnects, and close the old ones.
    ///
    /// Checked-out connections stay valid until dropped and are quit then.
    /// Stores built before the reset keep their old pool handle.
    pub async fn reset(&self) {
        let dropped: Vec<Arc<ConnectionPool>> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in &dropped {
            pool.close().await;
        }
        info!(dropped = dropped.len(), "connection pools reset");
    }

    pub fn pool_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .field("serializer", &self.serializer.name())
            .field("pools", &self.pool_count())
            .finish()
    }
}
