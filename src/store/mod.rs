//! Key-value persistence for engine state.
//!
//! The [`KvStore`] trait is the host's durable key-value capability: JSON
//! values addressed by string keys, surviving process restarts. The test
//! execution history store and the workspace default headers are built on
//! top of it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// Abstract durable key-value storage.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](KvStore::get) | Read a value, `None` when absent |
/// | [`set`](KvStore::set) | Insert or replace a value |
/// | [`delete`](KvStore::delete) | Remove a key, returns whether it existed |
/// | [`keys`](KvStore::keys) | List keys starting with a prefix |
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys beginning with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
