//! KeyDB / Redis connections via `fred`.
//!
//! Each pooled connection is its own [`fred::clients::Client`] so that a
//! checkout is exclusive and a lock holder's commands never interleave with
//! another caller's on the same socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Client;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, ListInterface, LuaInterface};
use fred::types::config::{
    Config as FredConfig, ConnectionConfig, ReconnectPolicy, ServerConfig, TlsConnector,
};
use fred::types::{Builder, CustomCommand, Expiration, ExpireOptions, SetOptions, Value};
use tracing::debug;

use super::{expiry_millis, expiry_secs, Connection, Connector, ScanPage};
use crate::endpoint::Endpoint;
use crate::error::{StoreError, StoreResult};

const RELEASE_IF_PREFIXED: &str = r#"
    local val = redis.call('GET', KEYS[1])
    if val and string.sub(val, 1, string.len(ARGV[1])) == ARGV[1] then
        redis.call('DEL', KEYS[1])
        return 1
    end
    return 0
"#;

/// Opens one `fred` client per pooled connection.
#[derive(Debug, Clone, Default)]
pub struct FredConnector;

/// Build the `fred` configuration for `endpoint`.
pub fn fred_config(endpoint: &Endpoint) -> StoreResult<FredConfig> {
    let mut config = FredConfig {
        server: ServerConfig::new_centralized(endpoint.host.as_str(), endpoint.port),
        ..FredConfig::default()
    };

    if endpoint.tls {
        config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    config.username = endpoint.username.clone();
    config.password = endpoint.password.clone();
    config.database = endpoint.database;

    Ok(config)
}

/// Commands are written once.  A replayed RPUSH after a reconnect would
/// queue the same lock token twice.
fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        max_command_attempts: 1,
        ..ConnectionConfig::default()
    }
}

fn fred_builder(endpoint: &Endpoint) -> StoreResult<Builder> {
    let mut builder = Builder::from_config(fred_config(endpoint)?);
    builder.set_connection_config(connection_config());

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
    Ok(builder)
}

#[async_trait]
impl Connector for FredConnector {
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Arc<dyn Connection>> {
        let client = fred_builder(endpoint)?.build()?;
        let _connection_task = client
            .init()
            .await
            .map_err(|e| StoreError::Connection(format!("connect to {endpoint}: {e}")))?;

        debug!(%endpoint, "engine connection opened");
        Ok(Arc::new(FredConnection { client }))
    }
}

#[derive(Clone)]
pub struct FredConnection {
    client: Client,
}

fn into_bytes(value: Value) -> Option<Bytes> {
    match value {
        Value::Null => None,
        Value::Bytes(bytes) => Some(bytes),
        Value::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        other => other.as_bytes().map(Bytes::copy_from_slice),
    }
}

fn into_byte_list(value: Value) -> Vec<Option<Bytes>> {
    value.into_array().into_iter().map(into_bytes).collect()
}

fn into_values(pairs: Vec<(String, Bytes)>) -> Vec<(String, Value)> {
    pairs
        .into_iter()
        .map(|(k, v)| (k, Value::Bytes(v)))
        .collect()
}

#[async_trait]
impl Connection for FredConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let value: Value = self.client.get(key).await?;
        Ok(into_bytes(value))
    }

    async fn set(&self, key: &str, value: Bytes) -> StoreResult<()> {
        let _: () = self
            .client
            .set(key, Value::Bytes(value), None, None, false)
            .await?;
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> StoreResult<Vec<Option<Bytes>>> {
        let value: Value = self.client.mget(keys).await?;
        Ok(into_byte_list(value))
    }

    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> StoreResult<()> {
        let _: () = self.client.mset(into_values(pairs)).await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let result: Option<String> = self
            .client
            .set(
                key,
                value,
                Some(Expiration::PX(expiry_millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        Ok(result.is_some())
    }

    async fn del(&self, keys: Vec<String>) -> StoreResult<u64> {
        let removed: u64 = self.client.del(keys).await?;
        Ok(removed)
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: u32) -> StoreResult<ScanPage> {
        let value: Value = self
            .client
            .custom(
                CustomCommand::new_static("SCAN", None::<u16>, false),
                vec![
                    cursor.to_string(),
                    "MATCH".to_string(),
                    pattern.to_string(),
                    "COUNT".to_string(),
                    count.to_string(),
                ],
            )
            .await?;

        let mut parts = value.into_array().into_iter();
        let cursor = parts
            .next()
            .and_then(|v| v.as_string())
            .ok_or_else(|| StoreError::command("SCAN", "reply is missing the cursor"))?;
        let keys = parts
            .next()
            .map(|batch| {
                batch
                    .into_array()
                    .into_iter()
                    .filter_map(|k| k.as_string())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ScanPage { cursor, keys })
    }

    async fn del_if_prefixed(&self, key: &str, prefix: &str) -> StoreResult<bool> {
        let released: i64 = self
            .client
            .eval(
                RELEASE_IF_PREFIXED,
                vec![key.to_string()],
                vec![prefix.to_string()],
            )
            .await?;
        Ok(released == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        let value: Value = self.client.hget(key, field).await?;
        Ok(into_bytes(value))
    }

    async fn hset(&self, key: &str, pairs: Vec<(String, Bytes)>) -> StoreResult<()> {
        let _: () = self.client.hset(key, into_values(pairs)).await?;
        Ok(())
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let value: Value = self.client.hkeys(key).await?;
        Ok(value
            .into_array()
            .into_iter()
            .filter_map(|k| k.as_string())
            .collect())
    }

    async fn hdel(&self, key: &str, fields: Vec<String>) -> StoreResult<u64> {
        let removed: u64 = self.client.hdel(key, fields).await?;
        Ok(removed)
    }

    async fn hmget(&self, key: &str, fields: Vec<String>) -> StoreResult<Vec<Option<Bytes>>> {
        let value: Value = self.client.hmget(key, fields).await?;
        Ok(into_byte_list(value))
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let len: u64 = self.client.hlen(key).await?;
        Ok(len)
    }

    async fn rpush_expire_nx(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<u64> {
        let pipeline = self.client.pipeline();
        let _: () = pipeline.rpush(key, value.to_string()).await?;
        let _: () = pipeline
            .expire(key, expiry_secs(expiry), Some(ExpireOptions::NX))
            .await?;
        let (len, _expiry_set): (u64, i64) = pipeline.all().await?;
        Ok(len)
    }

    async fn lindex(&self, key: &str, index: i64) -> StoreResult<Option<String>> {
        let value: Option<String> = self.client.lindex(key, index).await?;
        Ok(value)
    }

    async fn lpop_expire(&self, key: &str, expiry: Duration) -> StoreResult<Option<String>> {
        let pipeline = self.client.pipeline();
        let _: () = pipeline.lpop(key, None).await?;
        let _: () = pipeline.expire(key, expiry_secs(expiry), None).await?;
        let (head, _expiry_set): (Option<String>, i64) = pipeline.all().await?;
        Ok(head)
    }

    async fn lrem_expire(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<u64> {
        let pipeline = self.client.pipeline();
        let _: () = pipeline.lrem(key, 0, value.to_string()).await?;
        let _: () = pipeline.expire(key, expiry_secs(expiry), None).await?;
        let (removed, _expiry_set): (u64, i64) = pipeline.all().await?;
        Ok(removed)
    }

    async fn quit(&self) -> StoreResult<()> {
        self.client.quit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fred_config_carries_endpoint_auth_and_db() {
        let endpoint = Endpoint::parse("redis://worker:pw@cache.local:6380/5").unwrap();
        let config = fred_config(&endpoint).unwrap();
        assert_eq!(config.username.as_deref(), Some("worker"));
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.database, Some(5));
        assert!(config.tls.is_none());
    }

    #[test]
    fn builder_never_replays_commands() {
        let endpoint = Endpoint::parse("redis://cache.local:6380").unwrap();
        let builder = fred_builder(&endpoint).unwrap();
        assert_eq!(builder.get_connection_config().max_command_attempts, 1);
        assert!(builder.get_policy().is_some());
    }

    #[test]
    fn null_values_are_absent() {
        assert_eq!(into_bytes(Value::Null), None);
        assert_eq!(
            into_bytes(Value::Bytes(Bytes::from_static(b"{}"))),
            Some(Bytes::from_static(b"{}"))
        );
    }

    #[test]
    fn byte_lists_keep_positions() {
        let reply = Value::Array(vec![
            Value::Bytes(Bytes::from_static(b"1")),
            Value::Null,
            Value::Bytes(Bytes::from_static(b"3")),
        ]);
        let list = into_byte_list(reply);
        assert_eq!(list.len(), 3);
        assert!(list[1].is_none());
    }
}
