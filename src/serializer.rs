//! Pluggable value codecs.
//!
//! A [`Serializer`] turns a JSON-like [`Value`] into the bytes stored in the
//! engine and back.  The codec's [`name`](Serializer::name) also feeds the
//! effective scope so two codecs never read each other's bytes.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Name of the codec that is exempt from scope prefixing.
pub const DEFAULT_SERIALIZER: &str = "json";

/// Encodes and decodes record values.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// Stable identifier, used in configuration and scope prefixes.
    fn name(&self) -> &'static str;

    fn dump(&self, value: &Value) -> StoreResult<Bytes>;

    fn load(&self, bytes: &[u8]) -> StoreResult<Value>;

    /// Whether this is the default codec (no scope prefix).
    fn is_default(&self) -> bool {
        self.name() == DEFAULT_SERIALIZER
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn dump(&self, value: &Value) -> StoreResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn load(&self, bytes: &[u8]) -> StoreResult<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn dump(&self, value: &Value) -> StoreResult<Bytes> {
        Ok(Bytes::from(serde_yaml::to_string(value)?))
    }

    fn load(&self, bytes: &[u8]) -> StoreResult<Value> {
        Ok(serde_yaml::from_slice(bytes)?)
    }
}

/// Look up a codec by its configured name.
pub fn serializer_by_name(name: &str) -> StoreResult<Arc<dyn Serializer>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonSerializer)),
        "yaml" | "yml" => Ok(Arc::new(YamlSerializer)),
        other => Err(StoreError::UnknownSerializer(other.to_string())),
    }
}

/// Storage namespace for `scope` under `serializer`.
pub fn effective_scope(serializer: &dyn Serializer, scope: &str) -> String {
    if serializer.is_default() {
        scope.to_string()
    } else {
        format!("{}:{scope}", serializer.name())
    }
}
