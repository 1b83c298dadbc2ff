//! Serialized access to one connection

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::{Error, Result};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`ConnectionQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl fmt::Display for QueueId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "queue-{}", self.0)
   }
}

/// Wraps exactly one [`Connection`] and runs the operations submitted to it
/// one at a time, in submission order.
///
/// The connection sits behind a `tokio::sync::Mutex`, which grants the lock in
/// the order it was requested. Callers on any task may share one queue; the
/// queue never retries on behalf of its connection.
pub struct ConnectionQueue {
   id: QueueId,
   connection: Mutex<Connection>,
}

impl ConnectionQueue {
   pub fn new(connection: Connection) -> Self {
      Self {
         id: QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)),
         connection: Mutex::new(connection),
      }
   }

   pub fn id(&self) -> QueueId {
      self.id
   }

   /// Run `body` against the connection once every earlier submission has
   /// finished, and return its result.
   ///
   /// ```no_run
   /// # async fn example(queue: &sqlx_sqlite_conn_pool::ConnectionQueue) -> sqlx_sqlite_conn_pool::Result<()> {
   /// let names: Vec<String> = queue
   ///    .execute(|conn| Box::pin(async move { conn.query("SELECT name FROM users").await }))
   ///    .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn execute<T, E, F>(&self, body: F) -> std::result::Result<T, E>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, std::result::Result<T, E>> + Send,
      T: Send,
   {
      let mut connection = self.connection.lock().await;
      body(&mut connection).await
   }

   /// Like [`execute`](Self::execute), but fails with `closed` instead of
   /// running `body` when the connection was closed while this call waited.
   pub(crate) async fn execute_open<T, E, F>(&self, body: F, closed: Error) -> std::result::Result<T, E>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, std::result::Result<T, E>> + Send,
      T: Send,
      E: From<Error>,
   {
      let mut connection = self.connection.lock().await;
      if connection.is_closed() {
         return Err(closed.into());
      }
      body(&mut connection).await
   }

   pub async fn is_closed(&self) -> bool {
      self.connection.lock().await.is_closed()
   }

   /// Close the connection after the operation in flight, if any, completes.
   pub async fn close(&self) -> Result<()> {
      self.connection.lock().await.close().await
   }
}

impl fmt::Debug for ConnectionQueue {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionQueue").field("id", &self.id).finish()
   }
}

impl PartialEq for ConnectionQueue {
   fn eq(&self, other: &Self) -> bool {
      self.id == other.id
   }
}

impl Eq for ConnectionQueue {}

impl Hash for ConnectionQueue {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.id.hash(state);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{ConnectionOptions, Error, StorageLocation, TableLockPolicy};
   use std::sync::Arc;
   use std::sync::atomic::AtomicBool;
   use std::time::Duration;

   async fn memory_queue() -> Arc<ConnectionQueue> {
      let conn = Connection::open(
         &StorageLocation::in_memory(),
         TableLockPolicy::FailFast,
         ConnectionOptions::read_write(),
      )
      .await
      .unwrap();
      Arc::new(ConnectionQueue::new(conn))
   }

   #[tokio::test]
   async fn test_queues_have_distinct_identity() {
      let a = memory_queue().await;
      let b = memory_queue().await;

      assert_ne!(a.id(), b.id());
      assert_ne!(*a, *b);
      assert_eq!(*a, *a);
   }

   #[tokio::test]
   async fn test_execute_returns_body_result_and_error() {
      let queue = memory_queue().await;

      let value: i64 = queue
         .execute(|conn| Box::pin(async move { Ok::<_, Error>(conn.query::<i64>("SELECT 41 + 1").await?[0]) }))
         .await
         .unwrap();
      assert_eq!(value, 42);

      let err = queue
         .execute(|conn| Box::pin(async move { conn.execute("SELEC 1").await }))
         .await
         .unwrap_err();
      assert!(matches!(err, Error::Sql(_)));
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
   async fn test_operations_run_one_at_a_time_in_submission_order() {
      let queue = memory_queue().await;
      let in_flight = Arc::new(AtomicBool::new(false));
      let order = Arc::new(std::sync::Mutex::new(Vec::new()));

      let mut tasks = Vec::new();
      for i in 0..6 {
         let queue = Arc::clone(&queue);
         let in_flight = Arc::clone(&in_flight);
         let order = Arc::clone(&order);

         tasks.push(tokio::spawn(async move {
            queue
               .execute(move |_conn| {
                  Box::pin(async move {
                     assert!(!in_flight.swap(true, Ordering::SeqCst), "operations overlapped");
                     tokio::time::sleep(Duration::from_millis(20)).await;
                     order.lock().unwrap().push(i);
                     in_flight.store(false, Ordering::SeqCst);
                     Ok::<_, Error>(())
                  })
               })
               .await
         }));

         // Let this task reach the queue before the next one is spawned
         tokio::time::sleep(Duration::from_millis(5)).await;
      }

      for task in tasks {
         task.await.unwrap().unwrap();
      }

      assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
   }

   #[tokio::test]
   async fn test_close_releases_connection() {
      let queue = memory_queue().await;
      queue.close().await.unwrap();

      let err = queue
         .execute(|conn| Box::pin(async move { conn.execute("SELECT 1").await }))
         .await
         .unwrap_err();
      assert!(matches!(err, Error::ConnectionClosed));
   }
}
