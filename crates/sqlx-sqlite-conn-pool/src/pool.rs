//! Elastic pool of read-only connections
//!
//! Readers are created on demand, so a burst of concurrent reads grows the
//! pool. Once the pool has been left alone for the drain delay with nothing
//! checked out, it collapses back to a single standing connection.
//!
//! ## Bookkeeping
//!
//! Every queue the pool created is in exactly one of two maps, `available` or
//! `busy`. Both maps, the drain flag and the optimize timestamp live in one
//! `PoolState` behind a `tokio::sync::Mutex`; nothing else mutates them. The
//! caller's closure runs outside that lock, on its own checked-out queue.
//!
//! ## Drain cycle
//!
//! ```text
//! enqueue ──► drain scheduled? ── yes ──► nothing
//!                   │ no
//!                   ▼
//!            sleep(drain_delay) ◄─────────────┐
//!                   │                          │
//!                   ▼                          │
//!            busy > 0 ────────── Reschedule ───┘
//!                   │ no
//!                   ▼
//!            available > 1 ──── Collapse: keep one, close the rest,
//!                   │                     maybe PRAGMA optimize
//!                   │ no
//!                   ▼
//!                 Idle
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{ConnectionOptions, PoolConfig, TableLockPolicy};
use crate::connection::Connection;
use crate::location::StorageLocation;
use crate::queue::{ConnectionQueue, QueueId};
use crate::{Error, Result};

/// Maintenance statement run on the standing reader during drain cycles
const OPTIMIZE_SQL: &str = "PRAGMA optimize";

/// Snapshot of the pool's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
   /// Open readers waiting to be handed out
   pub available: usize,
   /// Readers currently running a caller's closure
   pub busy: usize,
   /// Whether a drain cycle is pending
   pub drain_scheduled: bool,
}

impl PoolStats {
   /// Total number of open reader connections
   pub fn total(&self) -> usize {
      self.available + self.busy
   }
}

/// Result of one drain check
#[derive(Debug)]
enum DrainDecision {
   /// Readers are checked out; check again after another drain delay
   Reschedule,
   /// `keep` is now the only available reader; `discard` must be closed
   Collapse {
      keep: Arc<ConnectionQueue>,
      discard: Vec<Arc<ConnectionQueue>>,
      optimize: bool,
   },
   /// Nothing to trim
   Idle,
}

#[derive(Default)]
struct PoolState {
   available: HashMap<QueueId, Arc<ConnectionQueue>>,
   busy: HashMap<QueueId, Arc<ConnectionQueue>>,
   drain_scheduled: bool,
   last_optimize: Option<Instant>,
   closed: bool,
}

impl PoolState {
   fn take_available(&mut self) -> Option<Arc<ConnectionQueue>> {
      let id = *self.available.keys().next()?;
      self.available.remove(&id)
   }

   fn optimize_due(&self, interval: Option<Duration>, now: Instant) -> bool {
      match (interval, self.last_optimize) {
         (None, _) => false,
         (Some(_), None) => true,
         (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
      }
   }

   fn drain_step(&mut self, optimize_interval: Option<Duration>, now: Instant) -> DrainDecision {
      if !self.closed && !self.busy.is_empty() {
         return DrainDecision::Reschedule;
      }

      self.drain_scheduled = false;
      if self.closed || self.available.len() <= 1 {
         return DrainDecision::Idle;
      }

      let mut discard: Vec<_> = self.available.drain().map(|(_, queue)| queue).collect();
      let Some(keep) = discard.pop() else {
         return DrainDecision::Idle;
      };
      self.available.insert(keep.id(), Arc::clone(&keep));

      let optimize = self.optimize_due(optimize_interval, now);
      if optimize {
         self.last_optimize = Some(now);
      }

      DrainDecision::Collapse {
         keep,
         discard,
         optimize,
      }
   }

   fn stats(&self) -> PoolStats {
      PoolStats {
         available: self.available.len(),
         busy: self.busy.len(),
         drain_scheduled: self.drain_scheduled,
      }
   }
}

struct PoolInner {
   location: StorageLocation,
   lock_policy: TableLockPolicy,
   config: PoolConfig,
   state: Mutex<PoolState>,
}

impl PoolInner {
   async fn open_reader(&self) -> Result<Arc<ConnectionQueue>> {
      let mut conn =
         Connection::open(&self.location, self.lock_policy, ConnectionOptions::read_only()).await?;

      if let Some(prepare) = &self.config.preparation
         && let Err(err) = prepare(&mut conn).await
      {
         if let Err(close_err) = conn.close().await {
            warn!(error = %close_err, "Failed to close reader after preparation error");
         }
         return Err(err);
      }

      let queue = Arc::new(ConnectionQueue::new(conn));
      debug!(location = %self.location, queue = %queue.id(), "Created reader");
      Ok(queue)
   }

   async fn dequeue(&self) -> Result<Arc<ConnectionQueue>> {
      let mut state = self.state.lock().await;
      if state.closed {
         return Err(Error::DatabaseClosed);
      }

      let queue = match state.take_available() {
         Some(queue) => queue,
         // A failed open returns here, before the queue is ever marked busy
         None => self.open_reader().await?,
      };

      state.busy.insert(queue.id(), Arc::clone(&queue));
      trace!(queue = %queue.id(), available = state.available.len(), busy = state.busy.len(), "Dequeued reader");
      Ok(queue)
   }

   async fn enqueue(self: &Arc<Self>, queue: Arc<ConnectionQueue>) {
      let usable = !queue.is_closed().await;

      let mut state = self.state.lock().await;
      if state.busy.remove(&queue.id()).is_none() {
         // Already returned by an earlier, interrupted enqueue
         return;
      }

      if state.closed || !usable {
         drop(state);
         debug!(queue = %queue.id(), "Discarding returned reader");
         if let Err(err) = queue.close().await {
            warn!(queue = %queue.id(), error = %err, "Failed to close returned reader");
         }
         return;
      }

      trace!(queue = %queue.id(), available = state.available.len() + 1, busy = state.busy.len(), "Enqueued reader");
      state.available.insert(queue.id(), queue);

      if !state.drain_scheduled {
         state.drain_scheduled = true;
         self.schedule_drain();
      }
   }

   fn schedule_drain(self: &Arc<Self>) {
      let pool: Weak<Self> = Arc::downgrade(self);
      let delay = self.config.drain_delay;

      tokio::spawn(async move {
         loop {
            tokio::time::sleep(delay).await;
            let Some(pool) = pool.upgrade() else {
               return;
            };
            if !pool.drain().await {
               return;
            }
         }
      });
   }

   /// One drain check. Returns true when the drain must be rescheduled.
   async fn drain(&self) -> bool {
      let decision = {
         let mut state = self.state.lock().await;
         state.drain_step(self.config.optimize_interval, Instant::now())
      };

      match decision {
         DrainDecision::Reschedule => {
            trace!("Readers busy, rescheduling drain");
            true
         }
         DrainDecision::Idle => false,
         DrainDecision::Collapse {
            keep,
            discard,
            optimize,
         } => {
            debug!(kept = %keep.id(), closing = discard.len(), "Draining idle readers");

            for queue in discard {
               if let Err(err) = queue.close().await {
                  warn!(queue = %queue.id(), error = %err, "Failed to close drained reader");
               }
            }

            if optimize {
               let result = keep
                  .execute(|conn| Box::pin(async move { conn.execute(OPTIMIZE_SQL).await }))
                  .await;
               if let Err(err) = result {
                  warn!(queue = %keep.id(), error = %err, "Reader maintenance failed");
               }
            }

            false
         }
      }
   }
}

/// A reader checked out of the pool. Returned on [`finish`](Self::finish), or
/// from `Drop` if the caller's future is cancelled mid-read.
struct Checkout {
   pool: Arc<PoolInner>,
   queue: Option<Arc<ConnectionQueue>>,
}

impl Checkout {
   async fn finish(mut self) {
      // Cleared only once enqueue completes, so a cancelled finish still
      // returns the reader from `Drop`
      if let Some(queue) = &self.queue {
         self.pool.enqueue(Arc::clone(queue)).await;
      }
      self.queue = None;
   }
}

impl Drop for Checkout {
   fn drop(&mut self) {
      let Some(queue) = self.queue.take() else {
         return;
      };

      let pool = Arc::clone(&self.pool);
      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            handle.spawn(async move { pool.enqueue(queue).await });
         }
         Err(_) => warn!(queue = %queue.id(), "Reader dropped outside a runtime; not returned to pool"),
      }
   }
}

/// Pool of read-only [`ConnectionQueue`]s over one storage location.
///
/// Cloning the pool yields another handle to the same readers.
#[derive(Clone)]
pub struct ConnectionPool {
   inner: Arc<PoolInner>,
}

impl ConnectionPool {
   /// Create an empty pool. Readers are opened on first use.
   pub fn new(location: StorageLocation, lock_policy: TableLockPolicy, config: PoolConfig) -> Self {
      Self {
         inner: Arc::new(PoolInner {
            location,
            lock_policy,
            config,
            state: Mutex::new(PoolState::default()),
         }),
      }
   }

   pub fn location(&self) -> &StorageLocation {
      &self.inner.location
   }

   /// Run `body` on an available reader, opening a new one if none is free.
   ///
   /// Distinct calls run on distinct readers, so reads proceed in parallel.
   /// Errors opening or preparing a new reader are returned before `body` runs.
   pub async fn execute<T, E, F>(&self, body: F) -> std::result::Result<T, E>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, std::result::Result<T, E>> + Send,
      T: Send,
      E: From<Error>,
   {
      let queue = self.inner.dequeue().await?;
      let checkout = Checkout {
         pool: Arc::clone(&self.inner),
         queue: Some(Arc::clone(&queue)),
      };

      let result = queue.execute(body).await;
      checkout.finish().await;
      result
   }

   pub async fn stats(&self) -> PoolStats {
      self.inner.state.lock().await.stats()
   }

   /// Close every available reader and refuse further reads.
   ///
   /// Readers that are checked out keep running; each is closed as soon as it
   /// is returned. Calling this again is a no-op.
   pub async fn close(&self) -> Result<()> {
      let (available, busy) = {
         let mut state = self.inner.state.lock().await;
         if state.closed {
            return Ok(());
         }
         state.closed = true;
         let available: Vec<_> = state.available.drain().map(|(_, queue)| queue).collect();
         (available, state.busy.len())
      };

      debug!(location = %self.inner.location, closing = available.len(), busy, "Closing reader pool");

      let mut first_err = None;
      for queue in available {
         if let Err(err) = queue.close().await {
            warn!(queue = %queue.id(), error = %err, "Failed to close reader");
            first_err.get_or_insert(err);
         }
      }

      first_err.map_or(Ok(()), Err)
   }

   pub async fn is_closed(&self) -> bool {
      self.inner.state.lock().await.closed
   }
}

impl std::fmt::Debug for ConnectionPool {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionPool")
         .field("location", &self.inner.location)
         .field("config", &self.inner.config)
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicUsize, Ordering};

   async fn memory_queue(location: &StorageLocation) -> Arc<ConnectionQueue> {
      let conn = Connection::open(location, TableLockPolicy::FailFast, ConnectionOptions::read_write())
         .await
         .unwrap();
      Arc::new(ConnectionQueue::new(conn))
   }

   async fn state_with(available: usize, busy: usize) -> PoolState {
      let location = StorageLocation::in_memory();
      let mut state = PoolState {
         drain_scheduled: true,
         ..Default::default()
      };
      for _ in 0..available {
         let queue = memory_queue(&location).await;
         state.available.insert(queue.id(), queue);
      }
      for _ in 0..busy {
         let queue = memory_queue(&location).await;
         state.busy.insert(queue.id(), queue);
      }
      state
   }

   #[tokio::test]
   async fn test_drain_reschedules_while_busy() {
      let mut state = state_with(3, 1).await;
      let decision = state.drain_step(None, Instant::now());

      assert!(matches!(decision, DrainDecision::Reschedule));
      assert!(state.drain_scheduled);
      assert_eq!(state.available.len(), 3);
   }

   #[tokio::test]
   async fn test_drain_collapses_to_one_available() {
      let mut state = state_with(3, 0).await;
      let decision = state.drain_step(None, Instant::now());

      match decision {
         DrainDecision::Collapse {
            keep,
            discard,
            optimize,
         } => {
            assert_eq!(discard.len(), 2);
            assert!(!optimize);
            assert!(state.available.contains_key(&keep.id()));
            assert!(discard.iter().all(|q| !state.available.contains_key(&q.id())));
         }
         other => panic!("expected collapse, got {other:?}"),
      }

      assert_eq!(state.available.len(), 1);
      assert!(!state.drain_scheduled);
   }

   #[tokio::test]
   async fn test_drain_is_idle_with_one_or_zero_available() {
      for available in [0, 1] {
         let mut state = state_with(available, 0).await;
         let decision = state.drain_step(None, Instant::now());

         assert!(matches!(decision, DrainDecision::Idle));
         assert_eq!(state.available.len(), available);
         assert!(!state.drain_scheduled);
      }
   }

   #[tokio::test]
   async fn test_optimize_is_rate_limited() {
      let interval = Some(Duration::from_secs(60));
      let start = Instant::now();

      let mut state = state_with(2, 0).await;
      let first = state.drain_step(interval, start);
      assert!(matches!(first, DrainDecision::Collapse { optimize: true, .. }));

      let queue = memory_queue(&StorageLocation::in_memory()).await;
      state.available.insert(queue.id(), queue);
      let second = state.drain_step(interval, start + Duration::from_secs(1));
      assert!(matches!(second, DrainDecision::Collapse { optimize: false, .. }));

      let queue = memory_queue(&StorageLocation::in_memory()).await;
      state.available.insert(queue.id(), queue);
      let third = state.drain_step(interval, start + Duration::from_secs(61));
      assert!(matches!(third, DrainDecision::Collapse { optimize: true, .. }));
   }

   #[tokio::test]
   async fn test_failed_preparation_never_enters_busy() {
      let location = StorageLocation::in_memory();
      // Keeps the shared in-memory database alive
      let _writer = memory_queue(&location).await;

      let attempts = Arc::new(AtomicUsize::new(0));
      let counter = Arc::clone(&attempts);
      let config = PoolConfig::default().with_preparation(move |conn| {
         counter.fetch_add(1, Ordering::SeqCst);
         Box::pin(async move { conn.execute("SELEC 1").await })
      });
      let pool = ConnectionPool::new(location, TableLockPolicy::FailFast, config);

      let result: Result<()> = pool
         .execute(|_conn| Box::pin(async move { Ok(()) }))
         .await;

      assert!(matches!(result, Err(Error::Sql(_))));
      assert_eq!(attempts.load(Ordering::SeqCst), 1);
      assert_eq!(pool.stats().await.total(), 0);
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_read_cancelled_while_returning_is_still_returned() {
      let location = StorageLocation::in_memory();
      let _writer = memory_queue(&location).await;
      let pool = ConnectionPool::new(location, TableLockPolicy::FailFast, PoolConfig::default());

      let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
      let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

      let reader_pool = pool.clone();
      let read = tokio::spawn(async move {
         reader_pool
            .execute(move |conn| {
               Box::pin(async move {
                  let _ = started_tx.send(());
                  let _ = release_rx.await;
                  conn.query::<i64>("SELECT 1").await
               })
            })
            .await
      });

      started_rx.await.unwrap();

      // The body finishes, but returning the reader stalls on the state lock
      let state = pool.inner.state.lock().await;
      release_tx.send(()).unwrap();
      tokio::time::sleep(Duration::from_millis(50)).await;

      read.abort();
      assert!(read.await.unwrap_err().is_cancelled());
      drop(state);

      tokio::time::sleep(Duration::from_millis(50)).await;
      let stats = pool.stats().await;
      assert_eq!(stats.busy, 0);
      assert_eq!(stats.available, 1);
   }

   #[tokio::test]
   async fn test_duplicate_return_is_ignored() {
      let location = StorageLocation::in_memory();
      let _writer = memory_queue(&location).await;
      let pool = ConnectionPool::new(location, TableLockPolicy::FailFast, PoolConfig::default());

      let queue = pool.inner.dequeue().await.unwrap();
      pool.inner.enqueue(Arc::clone(&queue)).await;
      pool.inner.enqueue(queue).await;

      let stats = pool.stats().await;
      assert_eq!(stats.busy, 0);
      assert_eq!(stats.available, 1);
   }

   #[tokio::test]
   async fn test_closed_pool_rejects_reads() {
      let location = StorageLocation::in_memory();
      let _writer = memory_queue(&location).await;
      let pool = ConnectionPool::new(location, TableLockPolicy::FailFast, PoolConfig::default());

      let one: Vec<i64> = pool
         .execute(|conn| Box::pin(async move { conn.query("SELECT 1").await }))
         .await
         .unwrap();
      assert_eq!(one, vec![1]);
      assert_eq!(pool.stats().await.available, 1);

      pool.close().await.unwrap();
      pool.close().await.unwrap();
      assert_eq!(pool.stats().await.total(), 0);

      let result: Result<Vec<i64>> = pool
         .execute(|conn| Box::pin(async move { conn.query("SELECT 1").await }))
         .await;
      assert!(matches!(result, Err(Error::DatabaseClosed)));
   }
}
