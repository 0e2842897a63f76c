//! In-process engine with Redis command semantics.
//!
//! Every connection handed out for one endpoint shares the same
//! [`MemoryEngine`], so several pools, tasks and "processes" in a test observe
//! one dataset exactly as they would through a real server.  Expiry follows
//! `tokio::time`, which lets paused-clock tests cover self-expiry quickly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{expiry_secs, Connection, Connector, ScanPage};
use crate::endpoint::Endpoint;
use crate::error::{StoreError, StoreResult};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Data {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn string(&mut self, command: &'static str, key: &str) -> StoreResult<Option<Bytes>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(b), ..
            }) => Ok(Some(b.clone())),
            Some(_) => Err(StoreError::command(command, WRONGTYPE)),
        }
    }

    fn hash(
        &mut self,
        command: &'static str,
        key: &str,
    ) -> StoreResult<Option<&mut HashMap<String, Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(StoreError::command(command, WRONGTYPE)),
        }
    }

    fn list(
        &mut self,
        command: &'static str,
        key: &str,
    ) -> StoreResult<Option<&mut VecDeque<String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(StoreError::command(command, WRONGTYPE)),
        }
    }

    fn expire(&mut self, key: &str, expiry: Duration, only_if_unset: bool) -> bool {
        match self.entry(key) {
            Some(entry) if !(only_if_unset && entry.expires_at.is_some()) => {
                let secs = expiry_secs(expiry).unsigned_abs();
                entry.expires_at = Instant::now().checked_add(Duration::from_secs(secs));
                true
            }
            _ => false,
        }
    }

    fn remove_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.data) {
            Some(Data::Hash(h)) => h.is_empty(),
            Some(Data::List(l)) => l.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

/// Shared in-memory dataset for one endpoint.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    keyspace: Mutex<Keyspace>,
    commands: AtomicU64,
    offline: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of round trips served so far.  Pipelines count once.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Simulate an unreachable engine: every command and connect fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut ks = self.lock();
        let at = ks.entry(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.lock().entry(key).is_some()
    }

    /// Snapshot of a list value, empty when missing.
    pub fn list_snapshot(&self, key: &str) -> Vec<String> {
        match self.lock().entry(key) {
            Some(Entry {
                data: Data::List(l),
                ..
            }) => l.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one round trip and hand out the keyspace.
    fn round_trip(&self) -> StoreResult<std::sync::MutexGuard<'_, Keyspace>> {
        if self.is_offline() {
            return Err(StoreError::Connection("engine offline".to_string()));
        }
        self.commands.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock())
    }
}

#[async_trait]
impl Connection for MemoryEngine {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.round_trip()?.string("GET", key)
    }

    async fn set(&self, key: &str, value: Bytes) -> StoreResult<()> {
        self.round_trip()?
            .entries
            .insert(key.to_string(), Entry::new(Data::Str(value)));
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> StoreResult<Vec<Option<Bytes>>> {
        let mut ks = self.round_trip()?;
        // MGET reports non-string keys as nil rather than failing.
        Ok(keys
            .iter()
            .map(|k| ks.string("MGET", k).unwrap_or(None))
            .collect())
    }

    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> StoreResult<()> {
        let mut ks = self.round_trip()?;
        for (key, value) in pairs {
            ks.entries.insert(key, Entry::new(Data::Str(value)));
        }
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut ks = self.round_trip()?;
        if ks.entry(key).is_some() {
            return Ok(false);
        }
        ks.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Str(Bytes::copy_from_slice(value.as_bytes())),
                expires_at: Instant::now().checked_add(ttl.max(Duration::from_millis(1))),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: Vec<String>) -> StoreResult<u64> {
        let mut ks = self.round_trip()?;
        let mut removed = 0;
        for key in &keys {
            ks.purge_if_expired(key);
            if ks.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: u32) -> StoreResult<ScanPage> {
        let mut ks = self.round_trip()?;
        let offset: usize = cursor
            .parse()
            .map_err(|_| StoreError::command("SCAN", "invalid cursor"))?;
        let all = ks.live_keys();
        let end = offset.saturating_add(count.max(1) as usize).min(all.len());
        let keys = all
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let cursor = if end >= all.len() {
            "0".to_string()
        } else {
            end.to_string()
        };
        Ok(ScanPage { cursor, keys })
    }

    async fn del_if_prefixed(&self, key: &str, prefix: &str) -> StoreResult<bool> {
        let mut ks = self.round_trip()?;
        let owned = matches!(
            ks.entry(key),
            Some(Entry { data: Data::Str(b), .. }) if b.starts_with(prefix.as_bytes())
        );
        if owned {
            ks.entries.remove(key);
        }
        Ok(owned)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        let mut ks = self.round_trip()?;
        Ok(ks.hash("HGET", key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, pairs: Vec<(String, Bytes)>) -> StoreResult<()> {
        let mut ks = self.round_trip()?;
        match ks.hash("HSET", key)? {
            Some(hash) => hash.extend(pairs),
            None => {
                ks.entries.insert(
                    key.to_string(),
                    Entry::new(Data::Hash(pairs.into_iter().collect())),
                );
            }
        }
        Ok(())
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut ks = self.round_trip()?;
        Ok(ks
            .hash("HKEYS", key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: Vec<String>) -> StoreResult<u64> {
        let mut ks = self.round_trip()?;
        let removed = match ks.hash("HDEL", key)? {
            Some(hash) => fields.iter().filter(|f| hash.remove(*f).is_some()).count() as u64,
            None => 0,
        };
        ks.remove_if_empty(key);
        Ok(removed)
    }

    async fn hmget(&self, key: &str, fields: Vec<String>) -> StoreResult<Vec<Option<Bytes>>> {
        let mut ks = self.round_trip()?;
        let hash = ks.hash("HMGET", key)?;
        Ok(fields
            .iter()
            .map(|f| hash.as_ref().and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let mut ks = self.round_trip()?;
        Ok(ks.hash("HLEN", key)?.map_or(0, |h| h.len() as u64))
    }

    async fn rpush_expire_nx(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<u64> {
        let mut ks = self.round_trip()?;
        let len = match ks.list("RPUSH", key)? {
            Some(list) => {
                list.push_back(value.to_string());
                list.len() as u64
            }
            None => {
                let list = VecDeque::from([value.to_string()]);
                ks.entries
                    .insert(key.to_string(), Entry::new(Data::List(list)));
                1
            }
        };
        ks.expire(key, expiry, true);
        Ok(len)
    }

    async fn lindex(&self, key: &str, index: i64) -> StoreResult<Option<String>> {
        let mut ks = self.round_trip()?;
        let Some(list) = ks.list("LINDEX", key)? else {
            return Ok(None);
        };
        let len = list.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 {
            return Ok(None);
        }
        Ok(list.get(idx as usize).cloned())
    }

    async fn lpop_expire(&self, key: &str, expiry: Duration) -> StoreResult<Option<String>> {
        let mut ks = self.round_trip()?;
        let head = ks.list("LPOP", key)?.and_then(|l| l.pop_front());
        ks.remove_if_empty(key);
        ks.expire(key, expiry, false);
        Ok(head)
    }

    async fn lrem_expire(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<u64> {
        let mut ks = self.round_trip()?;
        let removed = match ks.list("LREM", key)? {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                (before - list.len()) as u64
            }
            None => 0,
        };
        ks.remove_if_empty(key);
        ks.expire(key, expiry, false);
        Ok(removed)
    }

    // Connections share the engine; there is no socket to close.
    async fn quit(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Hands out the shared [`MemoryEngine`] of each endpoint.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    engines: Mutex<HashMap<Endpoint, Arc<MemoryEngine>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine backing `endpoint`, created on first use.
    pub fn engine(&self, endpoint: &Endpoint) -> Arc<MemoryEngine> {
        let mut engines = self.engines.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            engines
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(MemoryEngine::new())),
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Arc<dyn Connection>> {
        let engine = self.engine(endpoint);
        if engine.is_offline() {
            return Err(StoreError::Connection(format!("{endpoint} refused connection")));
        }
        Ok(engine)
    }
}

/// Redis-style glob match supporting `*`, `?`, `[...]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_at(&p, &t)
}

fn glob_at(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => (0..=t.len()).any(|skip| glob_at(&p[1..], &t[skip..])),
        Some('?') => !t.is_empty() && glob_at(&p[1..], &t[1..]),
        Some('\\') if p.len() > 1 => t.first() == Some(&p[1]) && glob_at(&p[2..], &t[1..]),
        Some('[') => {
            let Some(close) = p.iter().skip(1).position(|c| *c == ']').map(|i| i + 1) else {
                return t.first() == Some(&'[') && glob_at(&p[1..], &t[1..]);
            };
            let Some(c) = t.first() else {
                return false;
            };
            let class = &p[1..close];
            let (negate, class) = match class.first() {
                Some('^') => (true, &class[1..]),
                _ => (false, class),
            };
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    hit |= (class[i]..=class[i + 2]).contains(c);
                    i += 3;
                } else {
                    hit |= class[i] == *c;
                    i += 1;
                }
            }
            hit != negate && glob_at(&p[close + 1..], &t[1..])
        }
        Some(literal) => t.first() == Some(literal) && glob_at(&p[1..], &t[1..]),
    }
}
