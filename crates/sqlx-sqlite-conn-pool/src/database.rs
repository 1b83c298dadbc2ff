//! SQLite database with one serialized writer and an elastic reader pool

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::{ConnectionOptions, DatabaseConfig, PrepareFn};
use crate::connection::Connection;
use crate::location::StorageLocation;
use crate::pool::{ConnectionPool, PoolStats};
use crate::queue::ConnectionQueue;
use crate::{Error, Result};

/// SQLite database with one serialized writer and a pool of concurrent readers.
///
/// ## Architecture
///
/// - **`writer`**: the only read-write connection, behind a [`ConnectionQueue`],
///   so writes never overlap and run in submission order
/// - **`readers`**: a [`ConnectionPool`] of read-only connections that grows
///   with concurrent reads and drains back to one connection when idle
///
/// ## State Management
///
/// - **`closed`**: Prevents use after the database has been closed
/// - **`location`**: Shared by the writer and every reader; also used to
///   delete the database files
///
/// ## Usage Pattern
///
/// ```text
/// 1. Open the database (writer first, then an empty reader pool)
/// 2. Writes: execute_write runs closures on the writer, one at a time
/// 3. Reads: execute_read runs closures on a pooled reader, in parallel
/// 4. Close the database when done
/// ```
#[derive(Debug)]
pub struct Database {
   writer: ConnectionQueue,
   readers: ConnectionPool,
   closed: AtomicBool,
   location: StorageLocation,
}

async fn prepare_writer(conn: &mut Connection, wal: bool, prepare: Option<&PrepareFn>) -> Result<()> {
   // WAL lets readers keep reading while a write transaction is open
   if wal && conn.location().is_on_disk() {
      conn.execute("PRAGMA journal_mode = WAL").await?;
   }

   if let Some(prepare) = prepare {
      prepare(conn).await?;
   }

   Ok(())
}

impl Database {
   /// Open the writer against `location` and set up the reader pool.
   ///
   /// The writer is opened first. If that fails, no reader pool is built.
   /// Readers are opened lazily by [`execute_read`](Self::execute_read).
   pub async fn open(location: StorageLocation, config: Option<DatabaseConfig>) -> Result<Arc<Self>> {
      let config = config.unwrap_or_default();

      let mut writer = Connection::open(&location, config.lock_policy, ConnectionOptions::read_write()).await?;

      if let Err(err) = prepare_writer(&mut writer, config.wal, config.writer_preparation.as_ref()).await {
         if let Err(close_err) = writer.close().await {
            warn!(error = %close_err, "Failed to close writer after preparation error");
         }
         return Err(err);
      }

      let readers = ConnectionPool::new(location.clone(), config.lock_policy, config.pool_config());

      debug!(location = %location, config = ?config, "Opened database");

      Ok(Arc::new(Self {
         writer: ConnectionQueue::new(writer),
         readers,
         closed: AtomicBool::new(false),
         location,
      }))
   }

   pub fn location(&self) -> &StorageLocation {
      &self.location
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Run `body` on the writer after every previously submitted write.
   ///
   /// ```no_run
   /// # async fn example(db: &sqlx_sqlite_conn_pool::Database) -> sqlx_sqlite_conn_pool::Result<()> {
   /// db.execute_write(|conn| {
   ///    Box::pin(async move { conn.execute("CREATE TABLE people (payload TEXT)").await })
   /// })
   /// .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn execute_write<T, E, F>(&self, body: F) -> std::result::Result<T, E>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, std::result::Result<T, E>> + Send,
      T: Send,
      E: From<Error>,
   {
      if self.is_closed() {
         return Err(Error::DatabaseClosed.into());
      }

      // A write queued behind `close` finds the writer already released
      self.writer.execute_open(body, Error::DatabaseClosed).await
   }

   /// Run `body` on a read-only connection from the pool.
   pub async fn execute_read<T, E, F>(&self, body: F) -> std::result::Result<T, E>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, std::result::Result<T, E>> + Send,
      T: Send,
      E: From<Error>,
   {
      if self.is_closed() {
         return Err(Error::DatabaseClosed.into());
      }
      self.readers.execute(body).await
   }

   /// Snapshot of the reader pool's bookkeeping
   pub async fn reader_stats(&self) -> PoolStats {
      self.readers.stats().await
   }

   /// Close the writer and every idle reader.
   ///
   /// The writer closes once any in-flight write finishes. Readers that are
   /// checked out are closed when their read completes. A temporary database
   /// is deleted. Calling this again is a no-op.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      let writer_result = self.writer.close().await;
      let readers_result = self.readers.close().await;

      if matches!(self.location, StorageLocation::Temporary { .. }) {
         self.remove_files().await?;
      }

      debug!(location = %self.location, "Closed database");
      writer_result.and(readers_result)
   }

   /// Close the database and delete its files, including WAL side files.
   pub async fn remove(&self) -> Result<()> {
      self.close().await?;
      self.remove_files().await
   }

   async fn remove_files(&self) -> Result<()> {
      for path in self.location.database_files() {
         match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed database file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
         }
      }
      Ok(())
   }
}
