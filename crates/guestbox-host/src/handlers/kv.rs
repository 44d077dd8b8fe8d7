//! In-memory key-value store for `OpCode::KvGet` / `OpCode::KvSet`.
//!
//! Entries may carry a TTL in seconds. Expired entries are dropped lazily
//! on access.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::debug;

use guestbox_common::HostFunctionError;

use crate::bridge::OpHandler;
use crate::payload::{KvPayload, RequestPayload};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Concurrent key-value store shared by the get and set handlers.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<String, Entry>,
}

impl KvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a live value.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.value.clone())
    }

    /// Set a value; `ttl` of `None` or zero never expires.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::InvalidArgument`] if the expiry is not
    /// representable as an [`Instant`].
    pub fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), HostFunctionError> {
        let expires_at = match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => Some(Instant::now().checked_add(ttl).ok_or_else(|| {
                HostFunctionError::invalid_argument(format!("ttl of {}s is out of range", ttl.as_secs()))
            })?),
            None => None,
        };
        self.entries.insert(key.into(), Entry { value, expires_at });
        Ok(())
    }

    /// Delete a key. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Returns `true` if the key holds a live value.
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of stored entries, including ones not yet reaped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_key(payload: &RequestPayload) -> Result<KvPayload, HostFunctionError> {
    let kv: KvPayload = payload.parse_as()?;
    if kv.key.is_empty() {
        return Err(HostFunctionError::invalid_argument("key must not be empty"));
    }
    Ok(kv)
}

/// `OpCode::KvGet`: `op` is `get` (default) or `exists`.
pub struct KvGetHandler {
    store: Arc<KvStore>,
}

impl KvGetHandler {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OpHandler for KvGetHandler {
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        let kv = parse_key(&payload)?;

        match payload.op.as_str() {
            "" | "get" => Ok(self.store.get(&kv.key).unwrap_or(Value::Null)),
            "exists" => Ok(json!(self.store.exists(&kv.key))),
            other => Err(HostFunctionError::KvStore(format!("unknown get op `{other}`"))),
        }
    }
}

/// `OpCode::KvSet`: `op` is `set` (default) or `delete`.
pub struct KvSetHandler {
    store: Arc<KvStore>,
}

impl KvSetHandler {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OpHandler for KvSetHandler {
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        let kv = parse_key(&payload)?;

        match payload.op.as_str() {
            "" | "set" => {
                let ttl = kv.ttl.map(Duration::from_secs);
                debug!(key = %kv.key, ttl_secs = kv.ttl, "KV set");
                self.store
                    .set(kv.key, kv.value.unwrap_or(Value::Null), ttl)?;
                Ok(Value::Null)
            }
            "delete" => Ok(json!(self.store.delete(&kv.key))),
            other => Err(HostFunctionError::KvStore(format!("unknown set op `{other}`"))),
        }
    }
}
