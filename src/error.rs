use std::fmt;

use thiserror::Error;

/// Errors raised by the cache subsystem.
///
/// Read-path operations on the facade (`get`, `has`, `stats`) never surface
/// these to callers; they degrade to a miss and log a warning. Write-path
/// operations and `get_or_set` compute failures propagate.
#[derive(Debug, Error)]
pub enum CacheError {
  /// A value could not be encoded to or decoded from its byte form.
  #[error("serialization failed: {source}")]
  Serialization {
    #[source]
    source: anyhow::Error,
  },

  /// The backing store failed during a cache operation.
  #[error("cache {op} failed{}: {source}", fmt_key(.key))]
  Backend {
    op: &'static str,
    key: Option<String>,
    #[source]
    source: anyhow::Error,
  },

  /// The compute closure passed to `get_or_set` failed. The cache is left
  /// unmodified.
  #[error("failed to compute value for cache key '{key}': {source}")]
  Compute {
    key: String,
    #[source]
    source: anyhow::Error,
  },
}

impl CacheError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Serialization { .. } => "CACHE-SER",
      Self::Backend { .. } => "CACHE-IO",
      Self::Compute { .. } => "CACHE-FN",
    }
  }

  pub(crate) fn backend(op: &'static str, key: &str, source: impl Into<anyhow::Error>) -> Self {
    Self::Backend {
      op,
      key: Some(key.to_string()),
      source: source.into(),
    }
  }
}

fn fmt_key(key: &Option<String>) -> String {
  match key {
    Some(k) => format!(" for key '{}'", k),
    None => String::new(),
  }
}

/// Phase of a transaction in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
  Commit,
  Rollback,
  /// The transaction scope had already completed when it was used.
  Closed,
}

impl fmt::Display for TxPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Commit => write!(f, "commit"),
      Self::Rollback => write!(f, "rollback"),
      Self::Closed => write!(f, "closed scope"),
    }
  }
}

/// Errors raised by the connection pool and the database client.
///
/// These always propagate; there is no silent degrade on the transactional
/// path.
#[derive(Debug, Error)]
pub enum DbError {
  /// The backend connection factory failed to produce a connection.
  #[error("failed to open backend connection: {source}")]
  Connect {
    #[source]
    source: anyhow::Error,
  },

  /// No connection became available within the pool timeout.
  #[error("connection pool exhausted after {waited_ms}ms")]
  PoolTimeout { waited_ms: u64 },

  /// A statement failed on the backend. The query fragment is truncated.
  #[error("query failed ({query}): {source}")]
  Query {
    query: String,
    #[source]
    source: anyhow::Error,
  },

  /// A transaction commit or rollback failed, or a completed transaction
  /// scope was used again.
  #[error("transaction {phase} failed: {source}")]
  Transaction {
    phase: TxPhase,
    #[source]
    source: anyhow::Error,
  },
}

impl DbError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Connect { .. } => "DB-CONN",
      Self::PoolTimeout { .. } => "DB-POOL",
      Self::Query { .. } => "DB-QUERY",
      Self::Transaction { .. } => "DB-TX",
    }
  }

  pub(crate) fn query(sql: &str, source: impl Into<anyhow::Error>) -> Self {
    Self::Query {
      query: truncate_query(sql),
      source: source.into(),
    }
  }
}

const MAX_QUERY_FRAGMENT: usize = 100;

/// Truncate a query for inclusion in error messages and logs.
pub(crate) fn truncate_query(sql: &str) -> String {
  if sql.len() <= MAX_QUERY_FRAGMENT {
    return sql.to_string();
  }
  let mut end = MAX_QUERY_FRAGMENT;
  while !sql.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}...", &sql[..end])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_fragment_is_truncated() {
    let long = "SELECT ".repeat(40);
    let fragment = truncate_query(&long);
    assert!(fragment.len() <= MAX_QUERY_FRAGMENT + 3);
    assert!(fragment.ends_with("..."));

    let short = "SELECT 1";
    assert_eq!(truncate_query(short), short);
  }

  #[test]
  fn error_codes_are_stable() {
    let err = CacheError::backend("set", "k", anyhow::anyhow!("boom"));
    assert_eq!(err.code(), "CACHE-IO");

    let err = DbError::PoolTimeout { waited_ms: 30000 };
    assert_eq!(err.code(), "DB-POOL");
  }
}
