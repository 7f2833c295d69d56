use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut chars = input.char_indices().peekable();

  while let Some((i, c)) = chars.next() {
    if c != '$' {
      out.push(c);
      continue;
    }
    let rest = &input[i + 1..];
    if let Some(stripped) = rest.strip_prefix('{') {
      if let Some(end) = stripped.find('}') {
        let name = &stripped[..end];
        out.push_str(&std::env::var(name).unwrap_or_default());
        for _ in 0..name.chars().count() + 2 {
          chars.next();
        }
        continue;
      }
    }
    let len = rest
      .chars()
      .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
      .count();
    let starts_like_var = matches!(rest.chars().next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if len > 0 && starts_like_var {
      out.push_str(&std::env::var(&rest[..len]).unwrap_or_default());
      for _ in 0..len {
        chars.next();
      }
    } else {
      out.push(c);
    }
  }

  out
}

/// Top-level configuration for the cache and the connection pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub pool: PoolConfig,
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }
}

/// Cache configuration.
///
/// `backend` is a string so that an unrecognized value can fall back to the
/// memory backend with a warning instead of failing construction; the
/// fallback branch lives in `Cache::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_backend")]
  pub backend: String,
  #[serde(default)]
  pub memory: MemorySection,
  #[serde(default)]
  pub file: FileSection,
  #[serde(default)]
  pub compression: CompressionSection,
}

fn default_backend() -> String {
  "memory".into()
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: default_backend(),
      memory: MemorySection::default(),
      file: FileSection::default(),
      compression: CompressionSection::default(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
  /// Maximum number of entries before eviction triggers.
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
}

fn default_max_entries() -> usize {
  1000
}

impl Default for MemorySection {
  fn default() -> Self {
    Self {
      max_entries: default_max_entries(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSection {
  /// Directory for cache files. Falls back to the system temp directory
  /// with a warning when absent.
  #[serde(default)]
  pub directory: Option<PathBuf>,
  /// Maximum aggregate size of cache files in megabytes.
  #[serde(default = "default_max_size_mb")]
  pub max_size_mb: u64,
}

fn default_max_size_mb() -> u64 {
  100
}

impl Default for FileSection {
  fn default() -> Self {
    Self {
      directory: None,
      max_size_mb: default_max_size_mb(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSection {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Compression level, 1-9.
  #[serde(default = "default_level")]
  pub level: u32,
  /// Minimum payload size in bytes before compression is attempted.
  #[serde(default = "default_threshold")]
  pub threshold: usize,
}

fn default_true() -> bool {
  true
}
fn default_level() -> u32 {
  6
}
fn default_threshold() -> usize {
  1024
}

impl Default for CompressionSection {
  fn default() -> Self {
    Self {
      enabled: default_true(),
      level: default_level(),
      threshold: default_threshold(),
    }
  }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
  /// Connections created eagerly at pool construction.
  #[serde(default = "default_min_connections")]
  pub min_connections: usize,
  /// Hard cap on connections ever live at once.
  #[serde(default = "default_max_connections")]
  pub max_connections: usize,
  /// How long `acquire` blocks before failing.
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Idle connections older than this are probed before reuse.
  #[serde(default = "default_validation_interval_secs")]
  pub validation_interval_secs: u64,
  /// Batch size for `execute_many`.
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
}

fn default_min_connections() -> usize {
  1
}
fn default_max_connections() -> usize {
  5
}
fn default_timeout_secs() -> u64 {
  30
}
fn default_validation_interval_secs() -> u64 {
  30
}
fn default_batch_size() -> usize {
  100
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      min_connections: default_min_connections(),
      max_connections: default_max_connections(),
      timeout_secs: default_timeout_secs(),
      validation_interval_secs: default_validation_interval_secs(),
      batch_size: default_batch_size(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.cache.backend, "memory");
    assert_eq!(config.cache.memory.max_entries, 1000);
    assert_eq!(config.cache.file.max_size_mb, 100);
    assert!(config.cache.compression.enabled);
    assert_eq!(config.cache.compression.level, 6);
    assert_eq!(config.cache.compression.threshold, 1024);
    assert_eq!(config.pool.min_connections, 1);
    assert_eq!(config.pool.max_connections, 5);
    assert_eq!(config.pool.timeout_secs, 30);
    assert_eq!(config.pool.batch_size, 100);
  }

  #[test]
  fn partial_yaml_fills_defaults() {
    let yaml = "cache:\n  backend: file\n  file:\n    max_size_mb: 10\npool:\n  max_connections: 2\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.cache.backend, "file");
    assert_eq!(config.cache.file.max_size_mb, 10);
    assert_eq!(config.cache.memory.max_entries, 1000);
    assert_eq!(config.pool.max_connections, 2);
    assert_eq!(config.pool.min_connections, 1);
  }

  #[test]
  fn env_vars_expand() {
    std::env::set_var("ACORN_TEST_DIR", "/tmp/acorn");
    assert_eq!(expand_env_vars("dir: ${ACORN_TEST_DIR}/cache"), "dir: /tmp/acorn/cache");
    assert_eq!(expand_env_vars("dir: $ACORN_TEST_DIR"), "dir: /tmp/acorn");
    assert_eq!(expand_env_vars("no vars here"), "no vars here");
    assert_eq!(expand_env_vars("price: $5"), "price: $5");
  }
}
