//! Tiered caching engine: a typed facade over interchangeable entry stores
//! with TTL expiry, size-bounded LRU eviction, and optional compression.

mod codec;
mod file;
mod memory;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::Compressor;
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::CacheConfig;
use crate::error::CacheError;

/// Process-local cache counters. Never persisted; the file store's size is
/// recomputed from a directory scan when the store is opened.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
  pub backend: &'static str,
  pub items: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub size_bytes: u64,
  pub compression: bool,
}

/// The configured entry store. Closed set, selected once at construction.
enum Store {
  Memory(MemoryStore),
  File(FileStore),
}

/// Public cache API over one configured entry store.
///
/// Reads are best-effort: `get` and `has` swallow backend failures and
/// degrade to a miss with a logged warning. Writes propagate `CacheError`.
pub struct Cache {
  store: Store,
}

impl Cache {
  /// Build a cache from configuration. An unrecognized backend name falls
  /// back to the memory store with a warning rather than failing.
  pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
    let compressor = config
      .compression
      .enabled
      .then(|| Compressor::new(config.compression.level, config.compression.threshold));

    let store = match config.backend.as_str() {
      "memory" => Store::Memory(MemoryStore::new(config.memory.max_entries, compressor)),
      "file" => {
        let directory = match &config.file.directory {
          Some(dir) => dir.clone(),
          None => {
            tracing::warn!("no cache directory configured, using the system temp directory");
            std::env::temp_dir()
          }
        };
        let max_size = config.file.max_size_mb * 1024 * 1024;
        Store::File(FileStore::new(directory, max_size, compressor)?)
      }
      other => {
        tracing::warn!(backend = other, "unknown cache backend, falling back to memory");
        Store::Memory(MemoryStore::new(config.memory.max_entries, compressor))
      }
    };
    tracing::debug!(backend = config.backend, "cache initialized");
    Ok(Self { store })
  }

  /// Store `value` under `key`, expiring after `ttl` if given.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
    let bytes = codec::serialize(value)?;
    match &self.store {
      Store::Memory(s) => s.set(key, bytes, ttl),
      Store::File(s) => s.set(key, bytes, ttl),
    }
  }

  /// Fetch the value for `key`. Misses, expired entries, and backend
  /// failures all yield `None`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    match self.try_get(key) {
      Ok(value) => value,
      Err(e) => {
        tracing::warn!(key, error = %e, "cache read failed, treating as miss");
        // A durable entry whose payload no longer decodes is corrupt:
        // drop the file so the failure does not repeat on every read.
        if matches!(&self.store, Store::File(_)) && matches!(e, CacheError::Serialization { .. }) {
          let _ = self.delete(key);
        }
        None
      }
    }
  }

  /// Like `get`, but returns `default` on a miss.
  pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
    self.get(key).unwrap_or(default)
  }

  fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
    let bytes = match &self.store {
      Store::Memory(s) => s.get(key)?,
      Store::File(s) => s.get(key)?,
    };
    match bytes {
      Some(bytes) => codec::deserialize(&bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Remove `key`; returns whether it was present.
  pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
    match &self.store {
      Store::Memory(s) => s.delete(key),
      Store::File(s) => s.delete(key),
    }
  }

  pub fn clear(&self) -> Result<(), CacheError> {
    match &self.store {
      Store::Memory(s) => s.clear(),
      Store::File(s) => s.clear(),
    }
  }

  /// Whether a live (non-expired) entry exists for `key`. Does not count a
  /// hit or a miss; backend failures degrade to `false`.
  pub fn has(&self, key: &str) -> bool {
    let result = match &self.store {
      Store::Memory(s) => s.has(key),
      Store::File(s) => s.has(key),
    };
    match result {
      Ok(present) => present,
      Err(e) => {
        tracing::warn!(key, error = %e, "cache existence check failed");
        false
      }
    }
  }

  /// Fetch `key`, or compute, store, and return the value on a miss.
  ///
  /// There is no single-flight coordination: concurrent callers missing on
  /// the same key each invoke `compute` independently and the last write
  /// wins. A failing `compute` leaves the cache unmodified.
  pub fn get_or_set<T, F>(&self, key: &str, compute: F, ttl: Option<Duration>) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, anyhow::Error>,
  {
    if let Some(value) = self.get(key) {
      return Ok(value);
    }
    tracing::debug!(key, "computing value for cache miss");
    let value = compute().map_err(|e| CacheError::Compute {
      key: key.to_string(),
      source: e,
    })?;
    self.set(key, &value, ttl)?;
    Ok(value)
  }

  pub fn stats(&self) -> CacheStats {
    match &self.store {
      Store::Memory(s) => s.stats(),
      Store::File(s) => s.stats(),
    }
  }
}
