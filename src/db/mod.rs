//! Pooled resource-connection manager and transactional client.

mod client;
mod connection;
mod pool;
mod sqlite;

pub use client::{DbClient, Transaction};
pub use connection::{Connection, ConnectionFactory, Row};
pub use pool::ConnectionPool;
pub use sqlite::{SqliteConnection, SqliteFactory};
