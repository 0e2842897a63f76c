use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

/// How records of one scope are laid out in the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One hash per scope, one field per record.
    #[default]
    Hash,
    /// One string key per record, `{scope}||||{key}`, enumerated with SCAN.
    Prefixed,
}

impl FromStr for Layout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "prefixed" => Ok(Self::Prefixed),
            other => anyhow::bail!("unknown layout {other:?} (expected hash or prefixed)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockStrategy {
    /// FIFO ticket queue in a list with self-expiry.
    #[default]
    Queue,
    /// Single key `SET NX PX` with retries and jitter.
    SetNx,
}

impl FromStr for LockStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "set-nx" | "setnx" | "set_nx" => Ok(Self::SetNx),
            other => anyhow::bail!("unknown lock strategy {other:?} (expected queue or set-nx)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub strategy: LockStrategy,
    /// Self-expiry window (seconds) of a lock queue.  Keep it well above the
    /// longest expected hold.
    #[serde(default = "default_queue_expiry_secs")]
    pub queue_expiry_secs: u64,
    /// Lower bound of the random sleep between head polls.
    #[serde(default = "default_poll_min_micros")]
    pub poll_min_micros: u64,
    /// Upper bound of the random sleep between head polls.
    #[serde(default = "default_poll_max_micros")]
    pub poll_max_micros: u64,
    /// TTL (milliseconds) of a `set-nx` lock key.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
    /// `set-nx` attempts per round before backing off.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_queue_expiry_secs() -> u64 {
    10
}

fn default_poll_min_micros() -> u64 {
    200
}

fn default_poll_max_micros() -> u64 {
    20_000
}

// In ms
fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_jitter_ms() -> u64 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::default(),
            queue_expiry_secs: default_queue_expiry_secs(),
            poll_min_micros: default_poll_min_micros(),
            poll_max_micros: default_poll_max_micros(),
            ttl_ms: default_lock_ttl_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

impl LockConfig {
    pub fn queue_expiry(&self) -> Duration {
        Duration::from_secs(self.queue_expiry_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint used by the CLI when `--endpoint` is not given.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Connections per endpoint pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Give up on a pool checkout after this many milliseconds.  Unset means
    /// wait indefinitely.
    #[serde(default)]
    pub checkout_timeout_ms: Option<u64>,
    /// Value codec name (`json` or `yaml`).
    #[serde(default = "default_serializer")]
    pub serializer: String,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_pool_size() -> usize {
    4
}

fn default_serializer() -> String {
    crate::serializer::DEFAULT_SERIALIZER.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            pool_size: default_pool_size(),
            checkout_timeout_ms: None,
            serializer: default_serializer(),
            layout: Layout::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `SCOPESTORE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }

    /// Apply overrides from a variable lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            lookup(name)
                .filter(|raw| !raw.trim().is_empty())
                .map(|raw| {
                    raw.trim()
                        .parse::<T>()
                        .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}"))
                })
                .transpose()
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parse(lookup, "SCOPESTORE_ENDPOINT")? {
            self.endpoint = Some(v);
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_POOL_SIZE")? {
            self.pool_size = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_CHECKOUT_TIMEOUT_MS")? {
            self.checkout_timeout_ms = Some(v);
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_SERIALIZER")? {
            self.serializer = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LAYOUT")? {
            self.layout = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_STRATEGY")? {
            self.lock.strategy = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_QUEUE_EXPIRY")? {
            self.lock.queue_expiry_secs = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_POLL_MIN_MICROS")? {
            self.lock.poll_min_micros = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_POLL_MAX_MICROS")? {
            self.lock.poll_max_micros = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_TTL")? {
            self.lock.ttl_ms = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_RETRY_COUNT")? {
            self.lock.retry_count = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_RETRY_DELAY")? {
            self.lock.retry_delay_ms = v;
        }
        if let Some(v) = parse(lookup, "SCOPESTORE_LOCK_RETRY_JITTER")? {
            self.lock.retry_jitter_ms = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Optional YAML file, then environment overrides, then validation.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Largest expiry the engine accepts (a signed 64-bit integer).
const MAX_EXPIRY: u64 = i64::MAX as u64;

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.pool_size >= 1, "pool_size must be at least 1");
    anyhow::ensure!(
        (1..=MAX_EXPIRY).contains(&config.lock.queue_expiry_secs),
        "lock.queue_expiry_secs must be between 1 and {MAX_EXPIRY}"
    );
    anyhow::ensure!(
        config.lock.poll_min_micros <= config.lock.poll_max_micros,
        "lock.poll_min_micros must not exceed lock.poll_max_micros"
    );
    anyhow::ensure!(
        (1..=MAX_EXPIRY).contains(&config.lock.ttl_ms),
        "lock.ttl_ms must be between 1 and {MAX_EXPIRY}"
    );
    crate::serializer::serializer_by_name(&config.serializer)
        .with_context(|| format!("invalid serializer: {}", config.serializer))?;
    Ok(())
}
