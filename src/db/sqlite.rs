use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_rusqlite::Connection as AsyncConnection;

use super::connection::{Connection, ConnectionFactory, Row};

/// Produces SQLite connections for the pool, one rusqlite connection per
/// pooled slot.
pub struct SqliteFactory {
  path: String,
}

impl SqliteFactory {
  pub fn new(path: impl Into<String>) -> Self {
    Self { path: path.into() }
  }

  /// A named shared in-memory database: every pooled connection sees the
  /// same schema and data. The database lives as long as at least one
  /// connection stays open.
  pub fn in_memory(name: &str) -> Self {
    Self {
      path: format!("file:{}?mode=memory&cache=shared", name),
    }
  }
}

#[async_trait]
impl ConnectionFactory for SqliteFactory {
  type Conn = SqliteConnection;

  async fn connect(&self) -> Result<SqliteConnection, anyhow::Error> {
    let conn = AsyncConnection::open(&self.path).await?;
    conn
      .call(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
      })
      .await?;
    tracing::debug!(path = %self.path, "sqlite connection opened");
    Ok(SqliteConnection { conn, in_tx: false })
  }
}

/// One SQLite connection behind the generic connection seam.
///
/// rusqlite autocommits each statement, so the adapter opens an explicit
/// `BEGIN` before the first write and ends it on commit/rollback; commit and
/// rollback outside a transaction are no-ops.
pub struct SqliteConnection {
  conn: AsyncConnection,
  in_tx: bool,
}

impl SqliteConnection {
  async fn begin_if_needed(&mut self) -> Result<(), anyhow::Error> {
    if self.in_tx {
      return Ok(());
    }
    self
      .conn
      .call(|conn| conn.execute_batch("BEGIN").map_err(|e| e.into()))
      .await?;
    self.in_tx = true;
    Ok(())
  }

  async fn end_tx(&mut self, statement: &'static str) -> Result<(), anyhow::Error> {
    if !self.in_tx {
      return Ok(());
    }
    self
      .conn
      .call(move |conn| conn.execute_batch(statement).map_err(|e| e.into()))
      .await?;
    self.in_tx = false;
    Ok(())
  }
}

#[async_trait]
impl Connection for SqliteConnection {
  async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, anyhow::Error> {
    self.begin_if_needed().await?;
    let sql = sql.to_string();
    let params: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
    let affected = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let n = stmt.execute(rusqlite::params_from_iter(params))?;
        Ok(n as u64)
      })
      .await?;
    Ok(affected)
  }

  async fn execute_many(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<u64, anyhow::Error> {
    self.begin_if_needed().await?;
    let sql = sql.to_string();
    let sets: Vec<Vec<rusqlite::types::Value>> = params_list
      .iter()
      .map(|params| params.iter().map(json_to_sql).collect())
      .collect();
    let affected = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut total = 0u64;
        for params in sets {
          total += stmt.execute(rusqlite::params_from_iter(params))? as u64;
        }
        Ok(total)
      })
      .await?;
    Ok(affected)
  }

  async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, anyhow::Error> {
    let sql = sql.to_string();
    let params: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          let mut map = Row::new();
          for (i, name) in names.iter().enumerate() {
            let value: rusqlite::types::Value = row.get(i)?;
            map.insert(name.clone(), sql_to_json(value));
          }
          out.push(map);
        }
        Ok(out)
      })
      .await?;
    Ok(rows)
  }

  async fn commit(&mut self) -> Result<(), anyhow::Error> {
    self.end_tx("COMMIT").await
  }

  async fn rollback(&mut self) -> Result<(), anyhow::Error> {
    self.end_tx("ROLLBACK").await
  }

  async fn ping(&mut self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn close(&mut self) -> Result<(), anyhow::Error> {
    self
      .conn
      .clone()
      .close()
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
  use rusqlite::types::Value as Sql;
  match value {
    Value::Null => Sql::Null,
    Value::Bool(b) => Sql::Integer(*b as i64),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        Sql::Integer(i)
      } else {
        Sql::Real(n.as_f64().unwrap_or(f64::NAN))
      }
    }
    Value::String(s) => Sql::Text(s.clone()),
    // Arrays and objects are stored as JSON text.
    other => Sql::Text(other.to_string()),
  }
}

fn sql_to_json(value: rusqlite::types::Value) -> Value {
  use rusqlite::types::Value as Sql;
  match value {
    Sql::Null => Value::Null,
    Sql::Integer(i) => Value::from(i),
    Sql::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
    Sql::Text(s) => Value::String(s),
    Sql::Blob(b) => Value::String(hex::encode(b)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn json_params_map_to_sqlite_types() {
    use rusqlite::types::Value as Sql;
    assert_eq!(json_to_sql(&Value::Null), Sql::Null);
    assert_eq!(json_to_sql(&Value::Bool(true)), Sql::Integer(1));
    assert_eq!(json_to_sql(&serde_json::json!(42)), Sql::Integer(42));
    assert_eq!(json_to_sql(&serde_json::json!(1.5)), Sql::Real(1.5));
    assert_eq!(
      json_to_sql(&serde_json::json!("acorn")),
      Sql::Text("acorn".into())
    );
    assert_eq!(
      json_to_sql(&serde_json::json!([1, 2])),
      Sql::Text("[1,2]".into())
    );
  }
}
