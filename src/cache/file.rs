use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::codec::{self, Compressor};
use super::CacheStats;
use crate::error::CacheError;

const CACHE_EXT: &str = "cache";
const METADATA_LIMIT: usize = 64 * 1024;

/// Per-entry metadata, stored as a JSON record between the length prefix and
/// the payload.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
  key: String,
  /// Unix epoch seconds; absent means the entry never expires.
  expiry: Option<i64>,
  compressed: bool,
  original_size: usize,
  created: i64,
}

impl Metadata {
  fn is_expired(&self, now: i64) -> bool {
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

/// Durable entry store: one file per key, named by the SHA-256 digest of the
/// key. File layout is `[u32 LE metadata length][JSON metadata][payload]`.
///
/// Reads that hit structural corruption delete the file and report a miss;
/// durability degrades instead of failing.
pub struct FileStore {
  directory: PathBuf,
  max_size: u64,
  compressor: Option<Compressor>,
  counters: Mutex<Counters>,
}

impl FileStore {
  /// Opens (or creates) the cache directory and recomputes the aggregate
  /// size from a full scan, self-healing any drift left by a previous
  /// process.
  pub fn new(
    directory: impl Into<PathBuf>,
    max_size: u64,
    compressor: Option<Compressor>,
  ) -> Result<Self, CacheError> {
    let directory = directory.into();
    fs::create_dir_all(&directory)
      .map_err(|e| CacheError::Backend { op: "init", key: None, source: e.into() })?;

    let store = Self {
      directory,
      max_size,
      compressor,
      counters: Mutex::new(Counters::default()),
    };
    let size = store.scan_size();
    store.counters.lock().size_bytes = size;
    tracing::debug!(directory = %store.directory.display(), size_bytes = size, "file cache opened");
    Ok(store)
  }

  fn entry_path(&self, key: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    self.directory.join(format!("{}.{}", digest, CACHE_EXT))
  }

  fn is_cache_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == CACHE_EXT)
  }

  /// Sum of all cache file sizes from a directory scan.
  fn scan_size(&self) -> u64 {
    let Ok(entries) = fs::read_dir(&self.directory) else {
      return 0;
    };
    entries
      .flatten()
      .filter(|e| Self::is_cache_file(&e.path()))
      .filter_map(|e| e.metadata().ok())
      .map(|m| m.len())
      .sum()
  }

  fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
  }

  /// Write the full record for `key`, overwriting any existing file. The
  /// record is staged to a temp file and renamed so readers never observe a
  /// partial write.
  pub fn set(&self, key: &str, serialized: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
    let over_limit = { self.counters.lock().size_bytes > self.max_size };
    if over_limit {
      self.evict();
    }

    let original_size = serialized.len();
    let (payload, compressed) = match &self.compressor {
      Some(c) => c.compress(&serialized),
      None => (serialized, false),
    };

    let metadata = Metadata {
      key: key.to_string(),
      expiry: ttl.map(|t| Self::now_epoch() + t.as_secs() as i64),
      compressed,
      original_size,
      created: Self::now_epoch(),
    };
    let metadata_bytes = serde_json::to_vec(&metadata)
      .map_err(|e| CacheError::backend("set", key, e))?;

    let path = self.entry_path(key);
    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<u64> {
      let mut file = fs::File::create(&tmp)?;
      file.write_all(&(metadata_bytes.len() as u32).to_le_bytes())?;
      file.write_all(&metadata_bytes)?;
      file.write_all(&payload)?;
      file.sync_all()?;
      let len = file.metadata()?.len();
      drop(file);
      fs::rename(&tmp, &path)?;
      Ok(len)
    };

    let previous = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let written = write().map_err(|e| {
      let _ = fs::remove_file(&tmp);
      CacheError::backend("set", key, e)
    })?;

    let mut counters = self.counters.lock();
    counters.size_bytes = counters.size_bytes.saturating_sub(previous) + written;
    Ok(())
  }

  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let path = self.entry_path(key);
    let file = match fs::File::open(&path) {
      Ok(f) => f,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        self.counters.lock().misses += 1;
        return Ok(None);
      }
      Err(e) => return Err(CacheError::backend("get", key, e)),
    };

    match self.read_record(file) {
      Ok((metadata, payload)) => {
        if metadata.is_expired(Self::now_epoch()) {
          self.remove_path(&path);
          self.counters.lock().misses += 1;
          return Ok(None);
        }
        match codec::decompress(&payload, metadata.compressed) {
          Ok(bytes) => {
            self.counters.lock().hits += 1;
            Ok(Some(bytes))
          }
          Err(e) => {
            // Truncated payload: self-heal like any other corruption.
            tracing::warn!(key, error = %e, "corrupt cache file removed");
            self.remove_path(&path);
            self.counters.lock().misses += 1;
            Ok(None)
          }
        }
      }
      Err(e) => {
        // Corrupt record: self-heal by dropping the file.
        tracing::warn!(key, error = %e, "corrupt cache file removed");
        self.remove_path(&path);
        self.counters.lock().misses += 1;
        Ok(None)
      }
    }
  }

  /// Parse the length prefix, metadata record, and payload of one entry.
  fn read_record(&self, mut file: fs::File) -> Result<(Metadata, Vec<u8>), anyhow::Error> {
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let metadata_len = u32::from_le_bytes(len_bytes) as usize;
    if metadata_len == 0 || metadata_len > METADATA_LIMIT {
      anyhow::bail!("metadata length {} out of bounds", metadata_len);
    }

    let mut metadata_bytes = vec![0u8; metadata_len];
    file.read_exact(&mut metadata_bytes)?;
    let metadata: Metadata = serde_json::from_slice(&metadata_bytes)?;

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    Ok((metadata, payload))
  }

  fn remove_path(&self, path: &Path) {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if fs::remove_file(path).is_ok() {
      let mut counters = self.counters.lock();
      counters.size_bytes = counters.size_bytes.saturating_sub(size);
    }
  }

  pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
    let path = self.entry_path(key);
    if !path.exists() {
      return Ok(false);
    }
    self.remove_path(&path);
    Ok(true)
  }

  pub fn clear(&self) -> Result<(), CacheError> {
    let entries = fs::read_dir(&self.directory)
      .map_err(|e| CacheError::Backend { op: "clear", key: None, source: e.into() })?;
    for entry in entries.flatten() {
      let path = entry.path();
      if Self::is_cache_file(&path) {
        let _ = fs::remove_file(&path);
      }
    }
    self.counters.lock().size_bytes = 0;
    Ok(())
  }

  /// Expiry semantics match `get`, but hit/miss counters are untouched.
  pub fn has(&self, key: &str) -> Result<bool, CacheError> {
    let path = self.entry_path(key);
    let file = match fs::File::open(&path) {
      Ok(f) => f,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
      Err(e) => return Err(CacheError::backend("has", key, e)),
    };
    match self.read_record(file) {
      Ok((metadata, _)) => {
        if metadata.is_expired(Self::now_epoch()) {
          self.remove_path(&path);
          return Ok(false);
        }
        Ok(true)
      }
      Err(e) => {
        tracing::warn!(key, error = %e, "corrupt cache file removed");
        self.remove_path(&path);
        Ok(false)
      }
    }
  }

  /// Delete oldest files (by the more recent of mtime and atime) until the
  /// store is back under 75% of its maximum size, then rescan to resync the
  /// aggregate counter.
  fn evict(&self) {
    let Ok(entries) = fs::read_dir(&self.directory) else {
      return;
    };

    let mut files: Vec<(PathBuf, SystemTime, u64)> = entries
      .flatten()
      .filter(|e| Self::is_cache_file(&e.path()))
      .filter_map(|e| {
        let meta = e.metadata().ok()?;
        let modified = meta.modified().ok()?;
        let recency = match meta.accessed() {
          Ok(accessed) => modified.max(accessed),
          Err(_) => modified,
        };
        Some((e.path(), recency, meta.len()))
      })
      .collect();
    files.sort_by_key(|(_, recency, _)| *recency);

    let target = self.max_size / 4 * 3;
    let current = self.counters.lock().size_bytes;
    let space_to_free = current.saturating_sub(target);

    let mut freed = 0u64;
    let mut evicted = 0u64;
    for (path, _, size) in files {
      if freed >= space_to_free {
        break;
      }
      if fs::remove_file(&path).is_ok() {
        freed += size;
        evicted += 1;
      }
    }

    let mut counters = self.counters.lock();
    counters.evictions += evicted;
    counters.size_bytes = self.scan_size();
    tracing::debug!(evicted, freed_bytes = freed, "file cache eviction");
  }

  pub fn stats(&self) -> CacheStats {
    let items = fs::read_dir(&self.directory)
      .map(|entries| {
        entries
          .flatten()
          .filter(|e| Self::is_cache_file(&e.path()))
          .count()
      })
      .unwrap_or(0);
    let counters = self.counters.lock();
    CacheStats {
      backend: "file",
      items,
      hits: counters.hits,
      misses: counters.misses,
      evictions: counters.evictions,
      size_bytes: counters.size_bytes,
      compression: self.compressor.is_some(),
    }
  }
}
