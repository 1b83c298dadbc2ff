//! Configuration for connections, the reader pool and the database

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::connection::Connection;

/// One-time setup run against a freshly opened connection, e.g. to set
/// session-level pragmas.
pub type PrepareFn = Arc<dyn for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// What a connection does when the engine reports a table lock or busy database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableLockPolicy {
   /// Surface the lock as [`Error::Lock`](crate::Error::Lock) immediately
   FailFast,

   /// Retry the whole operation up to `max_retries` times, sleeping `delay`
   /// between attempts
   Retry { max_retries: u32, delay: Duration },
}

impl TableLockPolicy {
   /// Delay before the next attempt, or `None` once `attempt` retries are spent.
   pub(crate) fn next_delay(&self, attempt: u32) -> Option<Duration> {
      match *self {
         Self::FailFast => None,
         Self::Retry { max_retries, delay } => (attempt < max_retries).then_some(delay),
      }
   }
}

impl Default for TableLockPolicy {
   fn default() -> Self {
      Self::Retry {
         max_retries: 10,
         delay: Duration::from_millis(50),
      }
   }
}

/// Flags applied when a connection handle is opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
   /// Open with `SQLITE_OPEN_READONLY`. Read-write handles create the file if
   /// it is missing.
   pub read_only: bool,

   /// Open in multi-thread mode (`SQLITE_OPEN_NOMUTEX`) rather than serialized
   /// mode. Safe here because a handle is only ever driven by its own queue.
   pub multi_threaded: bool,

   /// Open with `SQLITE_OPEN_SHAREDCACHE`. In-memory locations always use a
   /// shared cache regardless of this flag.
   pub shared_cache: bool,

   /// Extra `PRAGMA key = value` pairs applied right after open
   pub pragmas: Vec<(String, String)>,
}

impl ConnectionOptions {
   pub fn read_write() -> Self {
      Self {
         multi_threaded: true,
         ..Default::default()
      }
   }

   pub fn read_only() -> Self {
      Self {
         read_only: true,
         multi_threaded: true,
         ..Default::default()
      }
   }

   pub fn with_pragma(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
      self.pragmas.push((key.into(), value.into()));
      self
   }
}

/// Configuration for the reader [`ConnectionPool`](crate::ConnectionPool)
#[derive(Clone)]
pub struct PoolConfig {
   /// How long the pool must stay untouched before idle readers are closed
   ///
   /// Default: 5 seconds
   pub drain_delay: Duration,

   /// Minimum time between two `PRAGMA optimize` runs during drain cycles.
   /// `None` disables the maintenance statement.
   ///
   /// Default: 60 minutes
   pub optimize_interval: Option<Duration>,

   /// Run once against every newly created reader connection
   pub preparation: Option<PrepareFn>,
}

impl PoolConfig {
   pub fn with_preparation<F>(mut self, f: F) -> Self
   where
      F: for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.preparation = Some(Arc::new(f));
      self
   }
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         drain_delay: Duration::from_secs(5),
         optimize_interval: Some(Duration::from_secs(60 * 60)),
         preparation: None,
      }
   }
}

impl fmt::Debug for PoolConfig {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PoolConfig")
         .field("drain_delay", &self.drain_delay)
         .field("optimize_interval", &self.optimize_interval)
         .field("preparation", &self.preparation.is_some())
         .finish()
   }
}

/// Configuration for a [`Database`](crate::Database)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::{DatabaseConfig, TableLockPolicy};
/// use std::time::Duration;
///
/// // Use defaults
/// let config = DatabaseConfig::default();
///
/// // Override just a few fields
/// let config = DatabaseConfig {
///    lock_policy: TableLockPolicy::FailFast,
///    drain_delay: Duration::from_secs(1),
///    ..Default::default()
/// };
///
/// // Run a pragma on every new reader
/// let config = DatabaseConfig::default().with_reader_preparation(|conn| {
///    Box::pin(async move { conn.execute("PRAGMA cache_size = -4000").await })
/// });
/// ```
#[derive(Clone)]
pub struct DatabaseConfig {
   /// Lock handling shared by the writer and every reader
   ///
   /// Default: retry 10 times, 50 ms apart
   pub lock_policy: TableLockPolicy,

   /// Idle time after which the reader pool collapses to one connection
   ///
   /// Default: 5 seconds
   pub drain_delay: Duration,

   /// Rate limit for `PRAGMA optimize` on the standing reader. `None` disables it.
   ///
   /// Default: 60 minutes
   pub optimize_interval: Option<Duration>,

   /// Switch on-disk databases to WAL journaling when the writer opens, so
   /// readers are not blocked while a write transaction is open
   ///
   /// Default: true
   pub wal: bool,

   /// Run once against the writer connection right after it opens
   pub writer_preparation: Option<PrepareFn>,

   /// Run once against every newly created reader connection
   pub reader_preparation: Option<PrepareFn>,
}

impl DatabaseConfig {
   pub fn with_writer_preparation<F>(mut self, f: F) -> Self
   where
      F: for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.writer_preparation = Some(Arc::new(f));
      self
   }

   pub fn with_reader_preparation<F>(mut self, f: F) -> Self
   where
      F: for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.reader_preparation = Some(Arc::new(f));
      self
   }

   pub(crate) fn pool_config(&self) -> PoolConfig {
      PoolConfig {
         drain_delay: self.drain_delay,
         optimize_interval: self.optimize_interval,
         preparation: self.reader_preparation.clone(),
      }
   }
}

impl Default for DatabaseConfig {
   fn default() -> Self {
      let pool = PoolConfig::default();
      Self {
         lock_policy: TableLockPolicy::default(),
         drain_delay: pool.drain_delay,
         optimize_interval: pool.optimize_interval,
         wal: true,
         writer_preparation: None,
         reader_preparation: None,
      }
   }
}

impl fmt::Debug for DatabaseConfig {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DatabaseConfig")
         .field("lock_policy", &self.lock_policy)
         .field("drain_delay", &self.drain_delay)
         .field("optimize_interval", &self.optimize_interval)
         .field("wal", &self.wal)
         .field("writer_preparation", &self.writer_preparation.is_some())
         .field("reader_preparation", &self.reader_preparation.is_some())
         .finish()
   }
}
