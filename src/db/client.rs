use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;

use super::connection::{Connection, ConnectionFactory, Row};
use super::pool::ConnectionPool;
use crate::config::PoolConfig;
use crate::error::{truncate_query, DbError, TxPhase};

/// Database client facade over a connection pool.
///
/// Standalone calls acquire a connection for the single statement,
/// auto-commit writes, and release the connection regardless of outcome.
/// `transaction` scopes a reentrant transaction over one held connection.
pub struct DbClient<F: ConnectionFactory> {
  pool: Arc<ConnectionPool<F>>,
  batch_size: usize,
}

impl<F: ConnectionFactory> DbClient<F> {
  /// Build the client and its pool, pre-warming the configured minimum
  /// number of connections.
  pub async fn connect(factory: F, config: &PoolConfig) -> Result<Self, DbError> {
    Ok(Self {
      pool: Arc::new(ConnectionPool::new(factory, config).await?),
      batch_size: config.batch_size.max(1),
    })
  }

  pub fn pool(&self) -> &ConnectionPool<F> {
    &self.pool
  }

  /// Run a write statement with auto-commit; returns the affected-row
  /// count.
  pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
    let mut conn = self.pool.acquire().await?;
    tracing::debug!(query = %truncate_query(sql), "executing statement");

    let result = match conn.execute(sql, params).await {
      Ok(affected) => match conn.commit().await {
        Ok(()) => Ok(affected),
        Err(e) => Err(DbError::Transaction {
          phase: TxPhase::Commit,
          source: e,
        }),
      },
      Err(e) => {
        let _ = conn.rollback().await;
        Err(DbError::query(sql, e))
      }
    };

    self.pool.release(conn);
    result
  }

  /// Run a read statement; returns rows as name-to-value maps.
  pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
    let mut conn = self.pool.acquire().await?;
    tracing::debug!(query = %truncate_query(sql), "executing query");

    let result = conn.query(sql, params).await.map_err(|e| DbError::query(sql, e));
    self.pool.release(conn);
    result
  }

  /// Run a read statement and return the first row, if any.
  pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, DbError> {
    Ok(self.query(sql, params).await?.into_iter().next())
  }

  /// Run one statement per parameter set, partitioned into fixed-size
  /// batches, with auto-commit across the whole call. A failure in any
  /// batch aborts the call; batches already sent are not unwound unless the
  /// call runs inside an explicit `transaction` scope.
  pub async fn execute_many(&self, sql: &str, params_list: &[Vec<Value>]) -> Result<u64, DbError> {
    if params_list.is_empty() {
      return Ok(0);
    }
    let mut conn = self.pool.acquire().await?;
    tracing::debug!(
      query = %truncate_query(sql),
      sets = params_list.len(),
      "executing batch statement"
    );

    let result = match run_batches(&mut conn, sql, params_list, self.batch_size).await {
      Ok(affected) => match conn.commit().await {
        Ok(()) => Ok(affected),
        Err(e) => Err(DbError::Transaction {
          phase: TxPhase::Commit,
          source: e,
        }),
      },
      Err(e) => {
        let _ = conn.rollback().await;
        Err(e)
      }
    };

    self.pool.release(conn);
    result
  }

  /// Run `scope` inside a transaction on one pooled connection.
  ///
  /// The scope receives a [`Transaction`] handle; nested
  /// `Transaction::transaction` calls share the same connection and the
  /// outer scope's atomicity. Commit happens exactly once, when the
  /// outermost scope exits cleanly; any failure (or a failed nested scope)
  /// rolls back everything written since the outermost scope began. The
  /// connection returns to the pool exactly once, after commit or rollback.
  pub async fn transaction<T, Fut, S>(&self, scope: S) -> Result<T, DbError>
  where
    S: FnOnce(Transaction<F::Conn>) -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
  {
    let conn = self.pool.acquire().await?;
    let tx = Transaction::new(conn, self.batch_size);
    tracing::debug!("transaction started");

    let outcome = scope(tx.clone()).await;

    let Some(mut conn) = tx.take_conn().await else {
      // The scope cannot take the connection; depth bookkeeping only.
      return outcome;
    };

    let final_result = if outcome.is_ok() && !tx.marked_for_rollback() {
      match conn.commit().await {
        Ok(()) => {
          tracing::debug!("transaction committed");
          outcome
        }
        Err(e) => Err(DbError::Transaction {
          phase: TxPhase::Commit,
          source: e,
        }),
      }
    } else {
      match conn.rollback().await {
        Ok(()) => tracing::debug!("transaction rolled back"),
        Err(e) => tracing::error!(error = %e, "transaction rollback failed"),
      }
      match outcome {
        // A nested scope failed but the outer scope swallowed the error:
        // the rollback already happened, so surface it.
        Ok(_) => Err(DbError::Transaction {
          phase: TxPhase::Rollback,
          source: anyhow::anyhow!("nested scope failed; transaction rolled back"),
        }),
        Err(e) => Err(e),
      }
    };

    self.pool.release(conn);
    final_result
  }
}

async fn run_batches<C: Connection>(
  conn: &mut C,
  sql: &str,
  params_list: &[Vec<Value>],
  batch_size: usize,
) -> Result<u64, DbError> {
  let mut total = 0u64;
  for chunk in params_list.chunks(batch_size) {
    total += conn
      .execute_many(sql, chunk)
      .await
      .map_err(|e| DbError::query(sql, e))?;
  }
  Ok(total)
}

struct TxInner<C> {
  conn: tokio::sync::Mutex<Option<C>>,
  depth: AtomicUsize,
  rollback: AtomicBool,
  batch_size: usize,
}

/// Handle to an in-flight transaction scope. Cheap to clone; all clones
/// share one connection and one rollback mark.
pub struct Transaction<C: Connection> {
  inner: Arc<TxInner<C>>,
}

impl<C: Connection> Clone for Transaction<C> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<C: Connection> Transaction<C> {
  fn new(conn: C, batch_size: usize) -> Self {
    Self {
      inner: Arc::new(TxInner {
        conn: tokio::sync::Mutex::new(Some(conn)),
        depth: AtomicUsize::new(1),
        rollback: AtomicBool::new(false),
        batch_size,
      }),
    }
  }

  /// Enter a nested scope sharing this transaction's connection and
  /// atomicity. Inner scopes are logical: no backend savepoint is created,
  /// and a failing inner scope marks the whole transaction for rollback.
  pub async fn transaction<T, Fut, S>(&self, scope: S) -> Result<T, DbError>
  where
    S: FnOnce(Transaction<C>) -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
  {
    let depth = self.inner.depth.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(depth, "entering nested transaction scope");

    let outcome = scope(self.clone()).await;

    self.inner.depth.fetch_sub(1, Ordering::SeqCst);
    if outcome.is_err() {
      self.inner.rollback.store(true, Ordering::SeqCst);
    }
    outcome
  }

  /// Current nesting depth; 1 inside the outermost scope.
  pub fn depth(&self) -> usize {
    self.inner.depth.load(Ordering::SeqCst)
  }

  /// Run a write statement on the held connection. Commit is deferred to
  /// the outermost scope exit.
  pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
    let mut guard = self.inner.conn.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    tracing::debug!(query = %truncate_query(sql), depth = self.depth(), "executing in transaction");
    conn.execute(sql, params).await.map_err(|e| DbError::query(sql, e))
  }

  /// Run a read statement on the held connection.
  pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
    let mut guard = self.inner.conn.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    conn.query(sql, params).await.map_err(|e| DbError::query(sql, e))
  }

  /// Run a read statement and return the first row, if any.
  pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, DbError> {
    Ok(self.query(sql, params).await?.into_iter().next())
  }

  /// Batched multi-execute on the held connection; commit is deferred to
  /// the outermost scope exit, so the batches are atomic here.
  pub async fn execute_many(&self, sql: &str, params_list: &[Vec<Value>]) -> Result<u64, DbError> {
    if params_list.is_empty() {
      return Ok(0);
    }
    let mut guard = self.inner.conn.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    run_batches(conn, sql, params_list, self.inner.batch_size).await
  }

  fn marked_for_rollback(&self) -> bool {
    self.inner.rollback.load(Ordering::SeqCst)
  }

  async fn take_conn(&self) -> Option<C> {
    self.inner.conn.lock().await.take()
  }
}

fn closed() -> DbError {
  DbError::Transaction {
    phase: TxPhase::Closed,
    source: anyhow::anyhow!("transaction scope has already completed"),
  }
}
