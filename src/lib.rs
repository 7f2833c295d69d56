//! acorncache: a tiered caching engine and a pooled database client with
//! reentrant transaction scoping.
//!
//! The two subsystems are independent: the cache is commonly used to
//! memoize results of pooled-connection queries, but neither depends on the
//! other.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;

pub use cache::{Cache, CacheStats, Compressor, FileStore, MemoryStore};
pub use config::{CacheConfig, Config, PoolConfig};
pub use db::{Connection, ConnectionFactory, ConnectionPool, DbClient, Row, SqliteFactory, Transaction};
pub use error::{CacheError, DbError, TxPhase};
