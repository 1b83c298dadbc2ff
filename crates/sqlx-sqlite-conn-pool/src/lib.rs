//! # sqlx-sqlite-conn-pool
//!
//! Connection management for an embedded SQLite database: exactly one
//! serialized writer and a dynamically sized pool of read-only connections.
//!
//! ## Core Types
//!
//! - **[`Database`]**: One writer queue plus one reader pool for a storage location
//! - **[`ConnectionPool`]**: Elastic pool of read-only connections that drains when idle
//! - **[`ConnectionQueue`]**: Runs closures against one connection, one at a time, in order
//! - **[`Connection`]**: A single native handle with `execute`, `run` and `query`
//! - **[`DatabaseConfig`]**: Lock policy, drain delay and preparation hooks
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Single writer**: SQLite allows one writer, so every write goes through one queue
//! - **Concurrent reads**: Each concurrent read gets its own read-only connection
//! - **Idle drain**: After `drain_delay` without checkouts the pool shrinks to one reader
//! - **Lock policy**: Busy and table-lock errors are retried or surfaced per [`TableLockPolicy`]
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_sqlite_conn_pool::{Database, NamedParameters, StorageLocation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sqlx_sqlite_conn_pool::Error> {
//!    let db = Database::open(StorageLocation::persistent("app.db"), None).await?;
//!
//!    db.execute_write(|conn| {
//!       Box::pin(async move {
//!          conn.execute("CREATE TABLE IF NOT EXISTS people (payload TEXT)").await?;
//!
//!          let mut params = NamedParameters::new();
//!          params.insert("payload".into(), json!({ "name": "William", "age": 30 }));
//!          conn.run("INSERT INTO people (payload) VALUES (:payload)", &params).await
//!       })
//!    })
//!    .await?;
//!
//!    let names: Vec<String> = db
//!       .execute_read(|conn| {
//!          Box::pin(async move { conn.query("SELECT json_extract(payload, '$.name') FROM people").await })
//!       })
//!       .await?;
//!
//!    println!("{names:?}");
//!    db.close().await
//! }
//! ```

mod config;
mod connection;
mod database;
mod error;
mod location;
mod params;
mod pool;
mod queue;

// Re-export public types
pub use config::{ConnectionOptions, DatabaseConfig, PoolConfig, PrepareFn, TableLockPolicy};
pub use connection::{Connection, RunResult};
pub use database::Database;
pub use error::{Error, NativeError, Result};
pub use location::StorageLocation;
pub use params::NamedParameters;
pub use pool::{ConnectionPool, PoolStats};
pub use queue::{ConnectionQueue, QueueId};
