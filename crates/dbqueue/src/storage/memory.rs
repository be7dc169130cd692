//! In-memory implementation of QueueStore for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::store::*;
use crate::api::TaskRecord;
use crate::clock::{Clock, SystemClock};
use crate::retry::TaskRetryStrategy;
use crate::settings::{QueueLocation, QueueShardId};

type TxId = u64;

struct StoredRow {
    location: QueueLocation,
    record: TaskRecord,
    /// Open transaction holding the row lock
    locked_by: Option<TxId>,
}

/// How to undo one change on rollback
enum Undo {
    Inserted(i64),
    Updated(TaskRecord),
    Deleted(QueueLocation, TaskRecord),
}

/// Outcome of trying to lock one row
enum RowLock {
    Acquired,
    Missing,
    HeldElsewhere,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    next_tx: TxId,
    rows: BTreeMap<i64, StoredRow>,
}

impl MemoryState {
    fn release_locks(&mut self, tx: TxId) {
        for row in self.rows.values_mut() {
            if row.locked_by == Some(tx) {
                row.locked_by = None;
            }
        }
    }

    fn lock_row(&mut self, tx: TxId, location: &QueueLocation, id: i64) -> RowLock {
        match self.rows.get_mut(&id) {
            Some(row) if &row.location == location => match row.locked_by {
                Some(owner) if owner != tx => RowLock::HeldElsewhere,
                _ => {
                    row.locked_by = Some(tx);
                    RowLock::Acquired
                }
            },
            _ => RowLock::Missing,
        }
    }
}

/// In-memory implementation of QueueStore
///
/// Provides the same semantics as the PostgreSQL store: rows touched by an
/// open transaction are locked and skipped by other pickers, deleting or
/// rescheduling a row locked elsewhere waits until that transaction ends,
/// uncommitted inserts stay invisible to other transactions, and a rollback
/// (or dropping the transaction) restores every row it changed.
///
/// # Example
///
/// ```
/// use dbqueue::settings::QueueShardId;
/// use dbqueue::storage::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new(QueueShardId::new("main"));
/// assert_eq!(store.total_task_count(), 0);
/// ```
pub struct InMemoryQueueStore {
    shard_id: QueueShardId,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<MemoryState>>,
    /// Signalled whenever a transaction releases its row locks
    released: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryQueueStore {
    pub fn new(shard_id: QueueShardId) -> Self {
        Self::with_clock(shard_id, Arc::new(SystemClock))
    }

    pub fn with_clock(shard_id: QueueShardId, clock: Arc<dyn Clock>) -> Self {
        Self {
            shard_id,
            clock,
            state: Arc::new(Mutex::new(MemoryState {
                next_id: 1,
                ..Default::default()
            })),
            released: Arc::new(Notify::new()),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `begin` fail, simulating a lost database
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current state of a task, including uncommitted changes
    pub fn find_task(&self, id: i64) -> Option<TaskRecord> {
        self.state.lock().rows.get(&id).map(|row| row.record.clone())
    }

    /// Number of tasks in one queue
    pub fn task_count(&self, location: &QueueLocation) -> usize {
        self.state
            .lock()
            .rows
            .values()
            .filter(|row| &row.location == location)
            .count()
    }

    pub fn total_task_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Overwrite a task's process time; false when the task does not exist
    pub fn set_process_time(&self, id: i64, process_time: DateTime<Utc>) -> bool {
        match self.state.lock().rows.get_mut(&id) {
            Some(row) => {
                row.record.process_time = process_time;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store is unavailable".to_string()));
        }

        let tx_id = {
            let mut state = self.state.lock();
            state.next_tx += 1;
            state.next_tx
        };

        Ok(Box::new(InMemoryTransaction {
            tx_id,
            state: Arc::clone(&self.state),
            released: Arc::clone(&self.released),
            clock: Arc::clone(&self.clock),
            undo: Vec::new(),
            finished: false,
        }))
    }
}

struct InMemoryTransaction {
    tx_id: TxId,
    state: Arc<Mutex<MemoryState>>,
    released: Arc<Notify>,
    clock: Arc<dyn Clock>,
    undo: Vec<Undo>,
    finished: bool,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }

    /// Lock a row for this transaction, waiting while another one holds it
    ///
    /// Returns false when the row does not exist in `location`.
    async fn acquire_row(&self, location: &QueueLocation, id: i64) -> bool {
        loop {
            let released = self.released.notified();
            let lock = self.state.lock().lock_row(self.tx_id, location, id);
            match lock {
                RowLock::Acquired => return true,
                RowLock::Missing => return false,
                RowLock::HeldElsewhere => released.await,
            }
        }
    }

    fn release_locks(&self) {
        self.state.lock().release_locks(self.tx_id);
        self.released.notify_waiters();
    }

    fn undo_all(&mut self) {
        let mut state = self.state.lock();
        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Inserted(id) => {
                    state.rows.remove(&id);
                }
                Undo::Updated(record) => {
                    if let Some(row) = state.rows.get_mut(&record.id) {
                        row.record = record;
                    }
                }
                Undo::Deleted(location, record) => {
                    state.rows.insert(
                        record.id,
                        StoredRow {
                            location,
                            record,
                            locked_by: None,
                        },
                    );
                }
            }
        }
        drop(state);
        self.release_locks();
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn enqueue(
        &mut self,
        location: &QueueLocation,
        task: NewTask,
    ) -> Result<i64, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let process_time = deadline(now, task.execution_delay)?;

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.rows.insert(
            id,
            StoredRow {
                location: location.clone(),
                record: TaskRecord {
                    id,
                    payload: task.payload,
                    attempts_count: 0,
                    create_date: now,
                    process_time,
                    correlation_id: task.correlation_id,
                    actor: task.actor,
                },
                locked_by: Some(self.tx_id),
            },
        );
        self.undo.push(Undo::Inserted(id));

        Ok(id)
    }

    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        retry: &TaskRetryStrategy,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let tx_id = self.tx_id;

        let mut state = self.state.lock();
        let candidate = state
            .rows
            .values()
            .filter(|row| &row.location == location)
            .filter(|row| row.locked_by.map_or(true, |owner| owner == tx_id))
            .filter(|row| row.record.process_time <= now)
            .min_by_key(|row| (row.record.process_time, row.record.id))
            .map(|row| row.record.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        if !matches!(state.lock_row(tx_id, location, id), RowLock::Acquired) {
            return Ok(None);
        }
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(None);
        };

        let previous = row.record.clone();
        let attempts_count = previous.attempts_count.saturating_add(1);
        row.record.attempts_count = attempts_count;
        row.record.process_time = deadline(now, retry.delay(attempts_count))?;
        let picked = row.record.clone();
        self.undo.push(Undo::Updated(previous));

        Ok(Some(picked))
    }

    async fn delete_task(&mut self, location: &QueueLocation, id: i64) -> Result<bool, StoreError> {
        self.ensure_open()?;
        if !self.acquire_row(location, id).await {
            return Ok(false);
        }

        let Some(row) = self.state.lock().rows.remove(&id) else {
            return Ok(false);
        };
        self.undo.push(Undo::Deleted(row.location, row.record));
        Ok(true)
    }

    async fn reenqueue(
        &mut self,
        location: &QueueLocation,
        id: i64,
        delay: Duration,
        reset_attempts: bool,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let process_time = deadline(self.clock.now(), delay)?;

        if !self.acquire_row(location, id).await {
            return Ok(false);
        }
        let mut state = self.state.lock();
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(false);
        };

        let previous = row.record.clone();
        row.record.process_time = process_time;
        if reset_attempts {
            row.record.attempts_count = 0;
        }
        self.undo.push(Undo::Updated(previous));
        Ok(true)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        self.undo.clear();
        self.release_locks();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        self.undo_all();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}
