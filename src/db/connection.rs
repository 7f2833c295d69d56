use async_trait::async_trait;
use serde_json::Value;

/// One result row: column name to dynamic value.
pub type Row = serde_json::Map<String, Value>;

/// An opaque backend connection: the execute/query capability the pool and
/// client are built over. Adapters wrap one driver connection each.
///
/// Connections run write statements inside an open transaction; `commit` and
/// `rollback` end it. A `commit`/`rollback` with no open transaction is a
/// no-op so autocommit callers never have to track state.
#[async_trait]
pub trait Connection: Send {
  /// Run a statement that returns no rows; yields the affected-row count.
  async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, anyhow::Error>;

  /// Run one statement per parameter set, reusing the prepared statement.
  /// Yields the summed affected-row count.
  async fn execute_many(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<u64, anyhow::Error>;

  /// Run a statement that returns rows.
  async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, anyhow::Error>;

  async fn commit(&mut self) -> Result<(), anyhow::Error>;

  async fn rollback(&mut self) -> Result<(), anyhow::Error>;

  /// Trivial liveness probe used when validating idle pooled connections.
  async fn ping(&mut self) -> Result<(), anyhow::Error>;

  async fn close(&mut self) -> Result<(), anyhow::Error>;
}

/// Produces live backend connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
  type Conn: Connection + 'static;

  async fn connect(&self) -> Result<Self::Conn, anyhow::Error>;
}
