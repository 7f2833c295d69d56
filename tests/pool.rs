use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use acorncache::{Connection, ConnectionFactory, ConnectionPool, DbError, PoolConfig, Row};

#[derive(Debug, Default)]
struct FactoryStats {
  connects: AtomicUsize,
  pings: AtomicUsize,
  closes: AtomicUsize,
}

#[derive(Debug)]
struct TestConn {
  stats: Arc<FactoryStats>,
  ping_failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for TestConn {
  async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64, anyhow::Error> {
    Ok(1)
  }

  async fn execute_many(&mut self, _sql: &str, params_list: &[Vec<Value>]) -> Result<u64, anyhow::Error> {
    Ok(params_list.len() as u64)
  }

  async fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, anyhow::Error> {
    Ok(Vec::new())
  }

  async fn commit(&mut self) -> Result<(), anyhow::Error> {
    Ok(())
  }

  async fn rollback(&mut self) -> Result<(), anyhow::Error> {
    Ok(())
  }

  async fn ping(&mut self) -> Result<(), anyhow::Error> {
    self.stats.pings.fetch_add(1, Ordering::SeqCst);
    let remaining = self.ping_failures.load(Ordering::SeqCst);
    if remaining > 0 {
      self.ping_failures.store(remaining - 1, Ordering::SeqCst);
      return Err(anyhow::anyhow!("connection gone"));
    }
    Ok(())
  }

  async fn close(&mut self) -> Result<(), anyhow::Error> {
    self.stats.closes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Clone)]
struct TestFactory {
  stats: Arc<FactoryStats>,
  ping_failures: Arc<AtomicUsize>,
}

impl TestFactory {
  fn new() -> Self {
    Self {
      stats: Arc::new(FactoryStats::default()),
      ping_failures: Arc::new(AtomicUsize::new(0)),
    }
  }
}

#[async_trait]
impl ConnectionFactory for TestFactory {
  type Conn = TestConn;

  async fn connect(&self) -> Result<TestConn, anyhow::Error> {
    self.stats.connects.fetch_add(1, Ordering::SeqCst);
    Ok(TestConn {
      stats: self.stats.clone(),
      ping_failures: self.ping_failures.clone(),
    })
  }
}

fn pool_config(min: usize, max: usize, timeout_secs: u64) -> PoolConfig {
  PoolConfig {
    min_connections: min,
    max_connections: max,
    timeout_secs,
    validation_interval_secs: 30,
    batch_size: 100,
  }
}

#[tokio::test]
async fn pre_warms_min_connections() {
  let factory = TestFactory::new();
  let stats = factory.stats.clone();

  let pool = ConnectionPool::new(factory, &pool_config(3, 5, 1)).await.unwrap();
  assert_eq!(stats.connects.load(Ordering::SeqCst), 3);
  assert_eq!(pool.idle_count(), 3);
  assert_eq!(pool.active_count(), 3);
}

#[tokio::test]
async fn reuses_released_connections() {
  let factory = TestFactory::new();
  let stats = factory.stats.clone();
  let pool = ConnectionPool::new(factory, &pool_config(1, 5, 1)).await.unwrap();

  let conn = pool.acquire().await.unwrap();
  pool.release(conn);
  let conn = pool.acquire().await.unwrap();
  pool.release(conn);

  // The warm connection served both acquisitions
  assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
  assert_eq!(pool.active_count(), 1);
}

#[tokio::test]
async fn exhausted_pool_blocks_until_release() {
  let factory = TestFactory::new();
  let pool = Arc::new(ConnectionPool::new(factory, &pool_config(0, 1, 5)).await.unwrap());

  let held = pool.acquire().await.unwrap();
  assert_eq!(pool.active_count(), 1);

  let waiter = {
    let pool = pool.clone();
    tokio::spawn(async move {
      let conn = pool.acquire().await.unwrap();
      pool.release(conn);
    })
  };

  tokio::time::sleep(Duration::from_millis(150)).await;
  assert!(!waiter.is_finished());

  pool.release(held);
  waiter.await.unwrap();
  assert_eq!(pool.active_count(), 1);
  assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn acquire_times_out_when_exhausted() {
  let factory = TestFactory::new();
  let pool = ConnectionPool::new(factory, &pool_config(0, 1, 0)).await.unwrap();

  let _held = pool.acquire().await.unwrap();
  let err = pool.acquire().await.unwrap_err();
  match err {
    DbError::PoolTimeout { .. } => {}
    other => panic!("expected pool timeout, got {other}"),
  }
  assert_eq!(err.code(), "DB-POOL");
}

#[tokio::test]
async fn stale_connections_are_validated_and_replaced() {
  let factory = TestFactory::new();
  let stats = factory.stats.clone();
  let ping_failures = factory.ping_failures.clone();

  // Zero interval: every idle connection is probed on reuse
  let mut config = pool_config(1, 2, 1);
  config.validation_interval_secs = 0;
  let pool = ConnectionPool::new(factory, &config).await.unwrap();

  // Healthy probe: the warm connection is reused
  let conn = pool.acquire().await.unwrap();
  assert_eq!(stats.pings.load(Ordering::SeqCst), 1);
  assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
  pool.release(conn);

  // Dead probe: discarded, closed, replaced
  ping_failures.store(1, Ordering::SeqCst);
  let conn = pool.acquire().await.unwrap();
  assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
  assert!(stats.connects.load(Ordering::SeqCst) >= 2);
  assert_eq!(pool.active_count(), 1);
  pool.release(conn);
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_max() {
  let factory = TestFactory::new();
  let stats = factory.stats.clone();
  let pool = Arc::new(ConnectionPool::new(factory, &pool_config(0, 3, 10)).await.unwrap());

  let peak = Arc::new(AtomicUsize::new(0));
  let mut tasks = Vec::new();
  for _ in 0..12 {
    let pool = pool.clone();
    let peak = peak.clone();
    tasks.push(tokio::spawn(async move {
      let conn = pool.acquire().await.unwrap();
      let active = pool.active_count();
      peak.fetch_max(active, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      pool.release(conn);
    }));
  }
  for task in tasks {
    task.await.unwrap();
  }

  assert!(peak.load(Ordering::SeqCst) <= 3);
  assert!(stats.connects.load(Ordering::SeqCst) <= 3);
  assert_eq!(pool.active_count(), 3);
}

#[tokio::test]
async fn acquire_fails_within_deadline_when_probes_keep_failing() {
  let factory = TestFactory::new();
  factory.ping_failures.store(usize::MAX, Ordering::SeqCst);

  let mut config = pool_config(1, 1, 1);
  config.validation_interval_secs = 0;
  let pool = ConnectionPool::new(factory, &config).await.unwrap();

  // Every probe fails and every replacement fails its probe too; the
  // acquire must still give up at its deadline instead of looping.
  let started = std::time::Instant::now();
  let err = pool.acquire().await.unwrap_err();
  assert_eq!(err.code(), "DB-POOL");
  let waited = started.elapsed();
  assert!(waited >= Duration::from_millis(900), "gave up too early: {waited:?}");
  assert!(waited < Duration::from_secs(5), "deadline overrun: {waited:?}");
}

#[tokio::test]
async fn release_after_close_all_drops_the_connection() {
  let factory = TestFactory::new();
  let pool = ConnectionPool::new(factory, &pool_config(1, 2, 5)).await.unwrap();

  let held = pool.acquire().await.unwrap();
  pool.close_all().await;
  assert_eq!(pool.active_count(), 0);

  // The late release must not re-park an untracked connection
  pool.release(held);
  assert_eq!(pool.idle_count(), 0);
  assert_eq!(pool.active_count(), 0);

  // The pool stays usable afterwards
  let conn = pool.acquire().await.unwrap();
  assert_eq!(pool.active_count(), 1);
  pool.release(conn);
  assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn close_all_drains_the_pool() {
  let factory = TestFactory::new();
  let stats = factory.stats.clone();
  let pool = ConnectionPool::new(factory, &pool_config(2, 5, 1)).await.unwrap();

  pool.close_all().await;
  assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
  assert_eq!(pool.active_count(), 0);
  assert_eq!(pool.idle_count(), 0);
}
