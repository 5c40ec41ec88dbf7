//! Record and cache store interfaces
//!
//! Everything above this module talks to storage through [`RecordStore`] and
//! [`CacheStore`] trait objects, so the index and the resolution cache can run
//! against the in-memory store, SQLite ([`crate::db::SqliteStore`]) or a test fake.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collection holding hostname -> app bindings
pub const HOSTNAMES: &str = "hostnames";
/// Collection holding the `<app_id>:<hostname>` secondary index
pub const APPS: &str = "apps";

/// Stream of values produced by a prefix scan.
///
/// Finite and single-pass; the order is whatever the backing store yields.
pub type ValueStream = BoxStream<'static, Result<Value>>;

/// Key-value record store with named collections
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Values of every key in `collection` starting with `prefix`
    async fn scan_prefix(&self, collection: &str, prefix: &str) -> Result<ValueStream>;
}

/// String cache with no expiry semantics of its own
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;
}

pub type SharedRecordStore = Arc<dyn RecordStore>;
pub type SharedCacheStore = Arc<dyn CacheStore>;

/// In-memory record store
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(key).cloned()))
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        if let Some(mut c) = self.collections.get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(&self, collection: &str, prefix: &str) -> Result<ValueStream> {
        let values: Vec<Value> = self
            .collections
            .get(collection)
            .map(|c| {
                c.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(stream::iter(values.into_iter().map(Ok)).boxed())
    }
}

/// In-memory cache store
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
