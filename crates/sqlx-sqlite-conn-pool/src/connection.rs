//! A single SQLite connection with lock-retry handling

use std::ffi::CStr;
use std::time::Duration;

use libsqlite3_sys as ffi;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection as _, Decode, Row, Sqlite, Type};
use tracing::{debug, trace};

use crate::config::{ConnectionOptions, TableLockPolicy};
use crate::error::NativeError;
use crate::location::StorageLocation;
use crate::params::{NamedParameters, PositionalSql, bind_value, to_positional};
use crate::{Error, Result};

/// Outcome of [`Connection::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
   /// The number of rows affected by the statement.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

/// Classifies a failed attempt. Returns `Ok(())` after sleeping when the
/// failure is a lock the policy still allows retrying.
async fn retry_or_fail(
   policy: TableLockPolicy,
   location: &StorageLocation,
   err: sqlx::Error,
   attempt: &mut u32,
) -> Result<()> {
   let err = Error::from_statement(err);

   if err.is_lock()
      && let Some(delay) = policy.next_delay(*attempt)
   {
      *attempt += 1;
      trace!(location = %location, attempt = *attempt, "Database locked, retrying");
      tokio::time::sleep(delay).await;
      return Ok(());
   }

   Err(err)
}

/// One native SQLite handle.
///
/// The handle is opened by [`Connection::open`] and released by
/// [`Connection::close`]; nothing can be issued after close. A connection is
/// not synchronized on its own: share it through a
/// [`ConnectionQueue`](crate::ConnectionQueue).
///
/// Every statement runs under the connection's [`TableLockPolicy`]: busy and
/// table-locked failures are retried as the policy allows, and the engine's own
/// busy timeout is disabled so the policy is the only source of waiting.
#[derive(Debug)]
pub struct Connection {
   location: StorageLocation,
   lock_policy: TableLockPolicy,
   options: ConnectionOptions,
   conn: Option<SqliteConnection>,
}

impl Connection {
   /// Open a handle against `location`.
   ///
   /// Fails with [`Error::Open`] when the engine cannot open the file or apply
   /// the requested pragmas.
   pub async fn open(
      location: &StorageLocation,
      lock_policy: TableLockPolicy,
      options: ConnectionOptions,
   ) -> Result<Self> {
      let mut connect_options = location
         .connect_options()?
         .read_only(options.read_only)
         .create_if_missing(!options.read_only)
         .serialized(!options.multi_threaded)
         .busy_timeout(Duration::ZERO);

      // In-memory locations already require a shared cache
      if options.shared_cache {
         connect_options = connect_options.shared_cache(true);
      }

      for (key, value) in &options.pragmas {
         connect_options = connect_options.pragma(key.clone(), value.clone());
      }

      let conn = SqliteConnection::connect_with(&connect_options)
         .await
         .map_err(Error::from_open)?;

      debug!(location = %location, read_only = options.read_only, "Opened connection");

      Ok(Self {
         location: location.clone(),
         lock_policy,
         options,
         conn: Some(conn),
      })
   }

   pub fn location(&self) -> &StorageLocation {
      &self.location
   }

   pub fn lock_policy(&self) -> TableLockPolicy {
      self.lock_policy
   }

   pub fn is_read_only(&self) -> bool {
      self.options.read_only
   }

   pub fn is_closed(&self) -> bool {
      self.conn.is_none()
   }

   fn handle(&mut self) -> Result<&mut SqliteConnection> {
      self.conn.as_mut().ok_or(Error::ConnectionClosed)
   }

   /// Run one or more `;`-separated statements without parameters.
   ///
   /// Meant for schema and pragma batches. A lock retry re-runs the whole batch.
   pub async fn execute(&mut self, sql: &str) -> Result<()> {
      let mut attempt = 0;
      loop {
         let conn = self.handle()?;
         let result = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await;
         match result {
            Ok(_) => return Ok(()),
            Err(err) => retry_or_fail(self.lock_policy, &self.location, err, &mut attempt).await?,
         }
      }
   }

   /// Run a single statement with named parameters to completion.
   ///
   /// ```no_run
   /// # async fn example(conn: &mut sqlx_sqlite_conn_pool::Connection) -> sqlx_sqlite_conn_pool::Result<()> {
   /// use sqlx_sqlite_conn_pool::NamedParameters;
   /// use serde_json::json;
   ///
   /// let mut params = NamedParameters::new();
   /// params.insert("payload".into(), json!({ "name": "William", "age": 30 }));
   /// conn.run("INSERT INTO people (payload) VALUES (:payload)", &params).await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn run(&mut self, sql: &str, params: &NamedParameters) -> Result<RunResult> {
      let PositionalSql { sql, values } = to_positional(sql, params)?;

      let mut attempt = 0;
      loop {
         let conn = self.handle()?;
         let mut query = sqlx::query(&sql);
         for value in values.iter().cloned() {
            query = bind_value(query, value);
         }

         let result = query.execute(&mut *conn).await;
         match result {
            Ok(done) => {
               return Ok(RunResult {
                  rows_affected: done.rows_affected(),
                  last_insert_id: done.last_insert_rowid(),
               });
            }
            Err(err) => retry_or_fail(self.lock_policy, &self.location, err, &mut attempt).await?,
         }
      }
   }

   /// Collect the first column of every row, decoded as `T`, in row order.
   pub async fn query<T>(&mut self, sql: &str) -> Result<Vec<T>>
   where
      T: for<'r> Decode<'r, Sqlite> + Type<Sqlite> + Send + Unpin,
   {
      self.query_with(sql, &NamedParameters::new()).await
   }

   /// Like [`query`](Self::query), with named parameters.
   pub async fn query_with<T>(&mut self, sql: &str, params: &NamedParameters) -> Result<Vec<T>>
   where
      T: for<'r> Decode<'r, Sqlite> + Type<Sqlite> + Send + Unpin,
   {
      let PositionalSql { sql, values } = to_positional(sql, params)?;

      let mut attempt = 0;
      let rows = loop {
         let conn = self.handle()?;
         let mut query = sqlx::query(&sql);
         for value in values.iter().cloned() {
            query = bind_value(query, value);
         }

         let result = query.fetch_all(&mut *conn).await;
         match result {
            Ok(rows) => break rows,
            Err(err) => retry_or_fail(self.lock_policy, &self.location, err, &mut attempt).await?,
         }
      };

      rows
         .iter()
         .map(|row| row.try_get::<T, _>(0).map_err(Error::from_statement))
         .collect()
   }

   /// The handle's current native error state, if it holds an error.
   pub async fn last_error(&mut self) -> Result<Option<NativeError>> {
      let conn = self.handle()?;
      let mut handle = conn.lock_handle().await.map_err(Error::from_statement)?;
      let db: *mut ffi::sqlite3 = handle.as_raw_handle().as_ptr();

      // SAFETY: `db` is valid while the handle lock is held, and sqlite3_errmsg
      // returns a NUL-terminated string owned by the connection that we copy
      // before releasing the lock.
      let (code, message) = unsafe {
         let code = ffi::sqlite3_extended_errcode(db);
         let message = CStr::from_ptr(ffi::sqlite3_errmsg(db))
            .to_string_lossy()
            .into_owned();
         (code, message)
      };

      Ok(NativeError::new(code, message))
   }

   /// Release the native handle. Calling this again is a no-op.
   pub async fn close(&mut self) -> Result<()> {
      let Some(conn) = self.conn.take() else {
         return Ok(());
      };

      conn.close().await.map_err(Error::from_statement)?;
      debug!(location = %self.location, read_only = self.options.read_only, "Closed connection");
      Ok(())
   }
}
