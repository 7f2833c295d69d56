use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::codec::{self, Compressor};
use super::CacheStats;
use crate::error::CacheError;

struct Entry {
  payload: Vec<u8>,
  compressed: bool,
  original_size: usize,
  expiry: Option<Instant>,
  last_access: Instant,
}

impl Entry {
  fn is_expired(&self, now: Instant) -> bool {
    self.expiry.is_some_and(|at| now > at)
  }
}

#[derive(Default)]
struct Counters {
  hits: u64,
  misses: u64,
  evictions: u64,
  size_bytes: u64,
}

struct Inner {
  entries: HashMap<String, Entry>,
  counters: Counters,
}

/// Volatile in-process entry store.
///
/// A single mutex covers the map and the counters; readers and writers are
/// mutually exclusive, which keeps the batch eviction simple and correct.
pub struct MemoryStore {
  inner: Mutex<Inner>,
  max_entries: usize,
  compressor: Option<Compressor>,
}

impl MemoryStore {
  pub fn new(max_entries: usize, compressor: Option<Compressor>) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        counters: Counters::default(),
      }),
      max_entries,
      compressor,
    }
  }

  /// Store serialized bytes under `key`. Evicts before inserting when the
  /// store is at capacity and the key is new.
  pub fn set(&self, key: &str, serialized: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
    let now = Instant::now();
    let original_size = serialized.len();
    let (payload, compressed) = match &self.compressor {
      Some(c) => c.compress(&serialized),
      None => (serialized, false),
    };

    let mut inner = self.inner.lock();
    if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(key) {
      evict(&mut inner);
    }
    if let Some(old) = inner.entries.insert(
      key.to_string(),
      Entry {
        payload,
        compressed,
        original_size,
        expiry: ttl.map(|t| now + t),
        last_access: now,
      },
    ) {
      inner.counters.size_bytes = inner.counters.size_bytes.saturating_sub(old.original_size as u64);
    }
    inner.counters.size_bytes += original_size as u64;
    Ok(())
  }

  /// Fetch and inflate the bytes for `key`. Expired entries are removed as
  /// a side effect and count as misses.
  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let now = Instant::now();
    let mut inner = self.inner.lock();

    match inner.entries.get(key) {
      None => {
        inner.counters.misses += 1;
        return Ok(None);
      }
      Some(entry) if entry.is_expired(now) => {
        if let Some(old) = inner.entries.remove(key) {
          inner.counters.size_bytes =
            inner.counters.size_bytes.saturating_sub(old.original_size as u64);
        }
        inner.counters.misses += 1;
        return Ok(None);
      }
      Some(_) => {}
    }

    let (payload, compressed) = match inner.entries.get_mut(key) {
      Some(entry) => {
        entry.last_access = now;
        (entry.payload.clone(), entry.compressed)
      }
      None => {
        inner.counters.misses += 1;
        return Ok(None);
      }
    };
    inner.counters.hits += 1;
    drop(inner);

    codec::decompress(&payload, compressed).map(Some)
  }

  /// Removes `key`; returns whether it was present.
  pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
    let mut inner = self.inner.lock();
    match inner.entries.remove(key) {
      Some(old) => {
        inner.counters.size_bytes =
          inner.counters.size_bytes.saturating_sub(old.original_size as u64);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  pub fn clear(&self) -> Result<(), CacheError> {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.counters.size_bytes = 0;
    Ok(())
  }

  /// Expiry semantics match `get`, but hit/miss counters are untouched.
  pub fn has(&self, key: &str) -> Result<bool, CacheError> {
    let now = Instant::now();
    let mut inner = self.inner.lock();
    match inner.entries.get(key) {
      None => Ok(false),
      Some(entry) if entry.is_expired(now) => {
        if let Some(old) = inner.entries.remove(key) {
          inner.counters.size_bytes =
            inner.counters.size_bytes.saturating_sub(old.original_size as u64);
        }
        Ok(false)
      }
      Some(_) => Ok(true),
    }
  }

  pub fn stats(&self) -> CacheStats {
    let inner = self.inner.lock();
    CacheStats {
      backend: "memory",
      items: inner.entries.len(),
      hits: inner.counters.hits,
      misses: inner.counters.misses,
      evictions: inner.counters.evictions,
      size_bytes: inner.counters.size_bytes,
      compression: self.compressor.is_some(),
    }
  }
}

/// Batch approximate-LRU eviction: sort by last access and drop the oldest
/// 10% (at least one). Amortizes the sort across many insertions instead of
/// maintaining a live ordering.
fn evict(inner: &mut Inner) {
  let mut by_age: Vec<(String, Instant)> = inner
    .entries
    .iter()
    .map(|(key, entry)| (key.clone(), entry.last_access))
    .collect();
  by_age.sort_by_key(|(_, at)| *at);

  let count = (by_age.len() / 10).max(1);
  for (key, _) in by_age.into_iter().take(count) {
    if let Some(old) = inner.entries.remove(&key) {
      inner.counters.size_bytes =
        inner.counters.size_bytes.saturating_sub(old.original_size as u64);
      inner.counters.evictions += 1;
    }
  }
  tracing::debug!(evicted = count, remaining = inner.entries.len(), "memory cache eviction");
}
