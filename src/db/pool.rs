use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::connection::{Connection, ConnectionFactory};
use crate::config::PoolConfig;
use crate::error::DbError;

/// Delay between retries while the pool is at capacity.
const RETRY_DELAY: Duration = Duration::from_millis(50);

struct IdleConn<C> {
  conn: C,
  last_used: Instant,
}

struct PoolState<C> {
  idle: Vec<IdleConn<C>>,
  /// Connections currently live, idle or held. Never exceeds the
  /// configured maximum.
  active: usize,
}

/// Bounded pool of reusable backend connections.
///
/// Idle connections are handed out most-recently-released first. A
/// connection idle longer than the validation interval is probed before
/// reuse; a failed probe discards it and a replacement is created. Callers
/// block (sleep-retry) up to the configured timeout when the pool is
/// exhausted.
pub struct ConnectionPool<F: ConnectionFactory> {
  factory: F,
  max_connections: usize,
  timeout: Duration,
  validation_interval: Duration,
  state: Mutex<PoolState<F::Conn>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
  /// Create the pool and pre-warm `min_connections` idle connections. A
  /// factory that cannot produce the warm set fails construction.
  pub async fn new(factory: F, config: &PoolConfig) -> Result<Self, DbError> {
    let pool = Self {
      factory,
      max_connections: config.max_connections.max(1),
      timeout: Duration::from_secs(config.timeout_secs),
      validation_interval: Duration::from_secs(config.validation_interval_secs),
      state: Mutex::new(PoolState {
        idle: Vec::with_capacity(config.max_connections),
        active: 0,
      }),
    };

    let warm = config.min_connections.min(pool.max_connections);
    for _ in 0..warm {
      pool.try_create().await?;
    }
    tracing::debug!(warm, max = pool.max_connections, "connection pool initialized");
    Ok(pool)
  }

  /// Take a connection, creating one if the pool is below its maximum, or
  /// blocking until one is released. Fails with a pool-timeout error when
  /// the deadline passes with nothing obtained.
  pub async fn acquire(&self) -> Result<F::Conn, DbError> {
    let deadline = Instant::now() + self.timeout;

    loop {
      let candidate = { self.state.lock().idle.pop() };
      match candidate {
        Some(idle) => {
          if idle.last_used.elapsed() < self.validation_interval {
            return Ok(idle.conn);
          }
          let mut conn = idle.conn;
          match conn.ping().await {
            Ok(()) => return Ok(conn),
            Err(e) => {
              tracing::warn!(error = %e, "discarding stale pooled connection");
              let _ = conn.close().await;
              {
                let mut state = self.state.lock();
                state.active = state.active.saturating_sub(1);
              }
              self.try_create().await?;
            }
          }
        }
        None => {
          if self.try_create().await? {
            // Fresh connection parked; pick it up on the next pass.
            continue;
          }
        }
      }

      // Every pass that obtained nothing lands here, so the deadline
      // bounds the loop even when probes keep failing.
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Err(DbError::PoolTimeout {
          waited_ms: self.timeout.as_millis() as u64,
        });
      }
      tokio::time::sleep(RETRY_DELAY.min(remaining)).await;
    }
  }

  /// Create a connection and park it idle, if the pool is below its
  /// maximum. Returns whether one was created.
  async fn try_create(&self) -> Result<bool, DbError> {
    {
      let mut state = self.state.lock();
      if state.active >= self.max_connections {
        return Ok(false);
      }
      // Reserve the slot before the (slow) factory call so concurrent
      // creators cannot overshoot the maximum.
      state.active += 1;
    }

    match self.factory.connect().await {
      Ok(conn) => {
        self.state.lock().idle.push(IdleConn {
          conn,
          last_used: Instant::now(),
        });
        Ok(true)
      }
      Err(e) => {
        self.state.lock().active -= 1;
        Err(DbError::Connect { source: e })
      }
    }
  }

  /// Return a connection to the idle set, stamped with the current time.
  ///
  /// A connection released after `close_all` reset the counters is no
  /// longer tracked; it is dropped instead of re-parked.
  pub fn release(&self, conn: F::Conn) {
    let mut state = self.state.lock();
    if state.idle.len() >= state.active {
      drop(state);
      drop(conn);
      tracing::debug!("dropping connection released after pool shutdown");
      return;
    }
    state.idle.push(IdleConn {
      conn,
      last_used: Instant::now(),
    });
  }

  /// Drain the idle set, closing every connection best-effort, and reset
  /// the active counter.
  pub async fn close_all(&self) {
    let drained: Vec<IdleConn<F::Conn>> = {
      let mut state = self.state.lock();
      state.active = 0;
      state.idle.drain(..).collect()
    };
    for mut idle in drained {
      if let Err(e) = idle.conn.close().await {
        tracing::debug!(error = %e, "error closing pooled connection");
      }
    }
    tracing::debug!("connection pool closed");
  }

  /// Connections currently live (idle plus held).
  pub fn active_count(&self) -> usize {
    self.state.lock().active
  }

  /// Connections currently parked in the idle set.
  pub fn idle_count(&self) -> usize {
    self.state.lock().idle.len()
  }
}
