//! Scope-partitioned record store.
//!
//! A [`ScopedStore`] binds one endpoint and one scope.  Every call borrows a
//! pooled connection (or the lock's pinned one, see [`ScopedStore::pinned`]),
//! runs its commands and returns it.  Nothing is cached locally: each read is
//! answered by the engine so other processes' writes are always visible.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::Layout;
use crate::endpoint::Endpoint;
use crate::engine::{escape_glob, Connection};
use crate::error::{StoreError, StoreResult};
use crate::lock::LockContext;
use crate::metrics::{Metrics, Operation};
use crate::pool::{ConnectionPool, PoolRegistry, PooledConnection};
use crate::serializer::{effective_scope, Serializer};

/// Separator between scope and key in the prefixed layout.
pub const KEY_DELIMITER: &str = "||||";

const SCAN_COUNT: u32 = 5_000;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// The record store as seen by callers.
#[async_trait]
pub trait Store: Send + Sync {
    /// The stored value, or `None` when the key was never set.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn set(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// Every key in the scope, in no particular order.
    async fn keys(&self) -> StoreResult<HashSet<String>>;

    async fn clear(&self) -> StoreResult<()>;

    /// Remove `keys`.  An empty slice sends nothing to the engine.
    async fn delete(&self, keys: &[&str]) -> StoreResult<()>;

    /// Values of the keys that exist; missing keys are left out of the map.
    async fn multi_read(&self, keys: &[&str]) -> StoreResult<HashMap<String, Value>>;

    /// Write every entry in one command.  An empty map sends nothing.
    async fn multi_write(&self, entries: &HashMap<String, Value>) -> StoreResult<()>;

    async fn merge(&self, entries: &HashMap<String, Value>) -> StoreResult<()> {
        self.multi_write(entries).await
    }

    async fn is_empty(&self) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// Connection source
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Source {
    Pool(Arc<ConnectionPool>),
    Pinned(Arc<dyn Connection>),
}

enum Borrowed {
    Pooled(PooledConnection),
    Pinned(Arc<dyn Connection>),
}

impl Deref for Borrowed {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Pooled(conn) => &**conn,
            Self::Pinned(conn) => conn.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// ScopedStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScopedStore {
    endpoint: Endpoint,
    scope: String,
    namespace: String,
    key_prefix: String,
    layout: Layout,
    serializer: Arc<dyn Serializer>,
    metrics: Arc<Metrics>,
    source: Source,
}

impl ScopedStore {
    /// Bind `scope` on `endpoint`, using the registry's serializer and layout.
    pub fn new(registry: &PoolRegistry, endpoint: &Endpoint, scope: &str) -> Self {
        let serializer = registry.serializer();
        let namespace = effective_scope(serializer.as_ref(), scope);
        Self {
            endpoint: endpoint.clone(),
            scope: scope.to_string(),
            key_prefix: format!("{namespace}{KEY_DELIMITER}"),
            namespace,
            layout: registry.config().layout,
            serializer,
            metrics: Arc::clone(&registry.metrics().metrics),
            source: Source::Pool(registry.pool_for(endpoint)),
        }
    }

    /// A copy of this store that runs on the connection of a held lock.
    pub fn pinned(&self, ctx: &LockContext) -> Self {
        Self {
            source: Source::Pinned(Arc::clone(ctx.connection())),
            ..self.clone()
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The scope as given by the caller.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The namespace actually used in the engine.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.source, Source::Pinned(_))
    }

    /// Typed read through `serde_json::Value`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        self.get(key)
            .await?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    /// Typed write through `serde_json::Value`.
    pub async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value).await
    }

    async fn connection(&self) -> StoreResult<Borrowed> {
        match &self.source {
            Source::Pool(pool) => Ok(Borrowed::Pooled(pool.checkout().await?)),
            Source::Pinned(conn) => Ok(Borrowed::Pinned(Arc::clone(conn))),
        }
    }

    fn encode_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn decode_key<'a>(&self, raw: &'a str) -> &'a str {
        raw.strip_prefix(self.key_prefix.as_str())
            .or_else(|| raw.rsplit(KEY_DELIMITER).next())
            .unwrap_or(raw)
    }

    fn scan_pattern(&self) -> String {
        format!("{}{KEY_DELIMITER}*", escape_glob(&self.namespace))
    }

    /// Walk the prefixed keyspace page by page.  With `first_only`, stop at
    /// the first page that yields a key.
    async fn scan_keys(
        &self,
        conn: &dyn Connection,
        first_only: bool,
    ) -> StoreResult<HashSet<String>> {
        let pattern = self.scan_pattern();
        let mut collected = HashSet::new();
        let mut cursor = "0".to_string();
        loop {
            let page = conn.scan(&cursor, &pattern, SCAN_COUNT).await?;
            collected.extend(page.keys.iter().map(|k| self.decode_key(k).to_string()));
            cursor = page.cursor;
            if cursor == "0" || (first_only && !collected.is_empty()) {
                break;
            }
        }
        Ok(collected)
    }

    fn decode(&self, bytes: &Bytes) -> StoreResult<Value> {
        self.serializer.load(bytes)
    }

    fn encode_entries(&self, entries: &HashMap<String, Value>) -> StoreResult<Vec<(String, Bytes)>> {
        entries
            .iter()
            .map(|(key, value)| {
                let field = match self.layout {
                    Layout::Hash => key.clone(),
                    Layout::Prefixed => self.encode_key(key),
                };
                Ok((field, self.serializer.dump(value)?))
            })
            .collect()
    }
}

impl std::fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStore")
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("layout", &self.layout)
            .field("serializer", &self.serializer.name())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

#[async_trait]
impl Store for ScopedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.connection().await?;
        let raw = match self.layout {
            Layout::Hash => conn.hget(&self.namespace, key).await?,
            Layout::Prefixed => conn.get(&self.encode_key(key)).await?,
        };
        drop(conn);
        self.metrics.record_operation(Operation::Get);
        trace!(scope = %self.namespace, %key, hit = raw.is_some(), "get");
        raw.as_ref().map(|bytes| self.decode(bytes)).transpose()
    }

    async fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let bytes = self.serializer.dump(value)?;
        let conn = self.connection().await?;
        match self.layout {
            Layout::Hash => {
                conn.hset(&self.namespace, vec![(key.to_string(), bytes)])
                    .await?
            }
            Layout::Prefixed => conn.set(&self.encode_key(key), bytes).await?,
        }
        self.metrics.record_operation(Operation::Set);
        debug!(scope = %self.namespace, %key, "set");
        Ok(())
    }

    async fn keys(&self) -> StoreResult<HashSet<String>> {
        let conn = self.connection().await?;
        let keys = match self.layout {
            Layout::Hash => conn.hkeys(&self.namespace).await?.into_iter().collect(),
            Layout::Prefixed => self.scan_keys(&*conn, false).await?,
        };
        self.metrics.record_operation(Operation::Keys);
        trace!(scope = %self.namespace, count = keys.len(), "keys");
        Ok(keys)
    }

    async fn clear(&self) -> StoreResult<()> {
        match self.layout {
            Layout::Hash => {
                let conn = self.connection().await?;
                conn.del(vec![self.namespace.clone()]).await?;
            }
            Layout::Prefixed => {
                let keys = self.keys().await?;
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.delete(&keys).await?;
            }
        }
        self.metrics.record_operation(Operation::Clear);
        debug!(scope = %self.namespace, "cleared");
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let conn = self.connection().await?;
        let removed = match self.layout {
            Layout::Hash => {
                conn.hdel(
                    &self.namespace,
                    keys.iter().map(|k| k.to_string()).collect(),
                )
                .await?
            }
            Layout::Prefixed => {
                conn.del(keys.iter().map(|k| self.encode_key(k)).collect())
                    .await?
            }
        };
        self.metrics.record_operation(Operation::Delete);
        debug!(scope = %self.namespace, requested = keys.len(), removed, "delete");
        Ok(())
    }

    async fn multi_read(&self, keys: &[&str]) -> StoreResult<HashMap<String, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.connection().await?;
        let values = match self.layout {
            Layout::Hash => {
                conn.hmget(
                    &self.namespace,
                    keys.iter().map(|k| k.to_string()).collect(),
                )
                .await?
            }
            Layout::Prefixed => {
                conn.mget(keys.iter().map(|k| self.encode_key(k)).collect())
                    .await?
            }
        };
        drop(conn);
        self.metrics.record_operation(Operation::MultiRead);

        let mut result = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            if let Some(bytes) = value {
                result.insert(key.to_string(), self.decode(&bytes)?);
            }
        }
        trace!(scope = %self.namespace, requested = keys.len(), found = result.len(), "multi_read");
        Ok(result)
    }

    async fn multi_write(&self, entries: &HashMap<String, Value>) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let pairs = self.encode_entries(entries)?;
        let conn = self.connection().await?;
        match self.layout {
            Layout::Hash => conn.hset(&self.namespace, pairs).await?,
            Layout::Prefixed => conn.mset(pairs).await?,
        }
        self.metrics.record_operation(Operation::MultiWrite);
        debug!(scope = %self.namespace, count = entries.len(), "multi_write");
        Ok(())
    }

    async fn is_empty(&self) -> StoreResult<bool> {
        let conn = self.connection().await?;
        let empty = match self.layout {
            Layout::Hash => conn.hlen(&self.namespace).await? == 0,
            Layout::Prefixed => self.scan_keys(&*conn, true).await?.is_empty(),
        };
        self.metrics.record_operation(Operation::IsEmpty);
        Ok(empty)
    }
}
