//! Scope-partitioned key-value store and FIFO distributed lock on a shared
//! Redis-compatible engine.
//!
//! A [`PoolRegistry`] owns one bounded connection pool per [`Endpoint`].
//! [`ScopedStore`] partitions the engine's keyspace by scope, and
//! [`with_lock`] serializes work across processes with a first-come,
//! first-served ticket queue.

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod pool;
pub mod serializer;
pub mod store;

pub use config::{Config, Layout, LockConfig, LockStrategy};
pub use endpoint::Endpoint;
pub use error::{StoreError, StoreResult};
pub use lock::{with_lock, Acquisition, LockContext};
pub use pool::{ConnectionPool, PoolRegistry};
pub use serializer::{Serializer, DEFAULT_SERIALIZER};
pub use store::{ScopedStore, Store};
