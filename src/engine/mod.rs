//! Engine command surface.
//!
//! [`Connection`] is the exact set of remote commands the store and lock use.
//! Any backing engine must honour Redis semantics for each of them, including
//! the pipelined pairs which go out in a single round trip.  [`Connector`]
//! opens connections for an [`Endpoint`]; the pool registry owns one.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::StoreResult;

pub use memory::{MemoryConnector, MemoryEngine};
pub use redis::{FredConnection, FredConnector};

/// One page of a `SCAN` iteration.  A returned cursor of `"0"` ends the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: String,
    pub keys: Vec<String>,
}

/// Remote commands used by the store and the lock.
#[async_trait]
pub trait Connection: Send + Sync {
    // -- strings --
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes) -> StoreResult<()>;
    async fn mget(&self, keys: Vec<String>) -> StoreResult<Vec<Option<Bytes>>>;
    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> StoreResult<()>;
    /// `SET key value NX PX ttl`.  Returns `true` when the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    // -- keyspace --
    async fn del(&self, keys: Vec<String>) -> StoreResult<u64>;
    async fn scan(&self, cursor: &str, pattern: &str, count: u32) -> StoreResult<ScanPage>;
    /// Atomically delete `key` when its value starts with `prefix`.
    async fn del_if_prefixed(&self, key: &str, prefix: &str) -> StoreResult<bool>;

    // -- hashes --
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>>;
    async fn hset(&self, key: &str, pairs: Vec<(String, Bytes)>) -> StoreResult<()>;
    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn hdel(&self, key: &str, fields: Vec<String>) -> StoreResult<u64>;
    async fn hmget(&self, key: &str, fields: Vec<String>) -> StoreResult<Vec<Option<Bytes>>>;
    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    // -- lists --
    /// Pipelined `RPUSH key value` + `EXPIRE key expiry NX`.  Returns the new
    /// list length.
    async fn rpush_expire_nx(&self, key: &str, value: &str, expiry: Duration)
        -> StoreResult<u64>;
    /// `LINDEX key index`; `None` when the index or the key is missing.
    async fn lindex(&self, key: &str, index: i64) -> StoreResult<Option<String>>;
    /// Pipelined `LPOP key` + `EXPIRE key expiry`.  Returns the popped head.
    async fn lpop_expire(&self, key: &str, expiry: Duration) -> StoreResult<Option<String>>;
    /// Pipelined `LREM key 0 value` + `EXPIRE key expiry`.  Returns how many
    /// copies of `value` were removed.
    async fn lrem_expire(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<u64>;

    /// Close the underlying socket.  The connection is unusable afterwards.
    async fn quit(&self) -> StoreResult<()>;
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Arc<dyn Connection>>;
}

/// Whole seconds for an `EXPIRE`, never below one.
pub(crate) fn expiry_secs(expiry: Duration) -> i64 {
    i64::try_from(expiry.as_secs().max(1)).unwrap_or(i64::MAX)
}

/// Whole milliseconds for a `PX`, never below one.
pub(crate) fn expiry_millis(expiry: Duration) -> i64 {
    i64::try_from(expiry.as_millis().max(1)).unwrap_or(i64::MAX)
}

/// Escape glob metacharacters so `text` matches literally in a `MATCH` pattern.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_glob_metacharacters() {
        assert_eq!(escape_glob("plain"), "plain");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn expiry_rounds_up_to_one_second() {
        assert_eq!(expiry_secs(Duration::from_millis(10)), 1);
        assert_eq!(expiry_secs(Duration::from_secs(10)), 10);
    }

    #[test]
    fn huge_expiries_saturate_instead_of_going_negative() {
        assert_eq!(expiry_secs(Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(expiry_millis(Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(expiry_millis(Duration::from_micros(10)), 1);
        assert_eq!(expiry_millis(Duration::from_secs(5)), 5_000);
    }
}
