//! Task queue storage - four-partition priority queue.
//!
//! Separate tables for pending/processing/completed/failed give O(1) pop and
//! cheap partition counts. Pending uses the composite key
//! "{score:020}:{task_id}" so that lower scores dequeue first and equal-score
//! entries never overwrite each other.

use anyhow::{Result, anyhow};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");
const PROCESSING: TableDefinition<&str, &[u8]> = TableDefinition::new("processing");
const COMPLETED: TableDefinition<&str, &[u8]> = TableDefinition::new("completed");
const FAILED: TableDefinition<&str, &[u8]> = TableDefinition::new("failed");

/// Partition sizes, in entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What the pop callback decided to do with the head entry.
pub enum PopDecision {
    /// Move the (possibly rewritten) record into processing.
    Take(Vec<u8>),
    /// Leave the head where it is and abort the transaction.
    Leave,
}

/// Pure storage layer for the task queue - data persistence only.
///
/// Retry semantics, scoring and record shapes live in the core crate; this
/// layer guarantees that every partition transition happens in a single
/// transaction, so a record is never visible in two partitions and never
/// lost between them.
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Database>,
    notify: Arc<Notify>,
    /// Pending-entry counter, checked before waiting so wakeups are not lost.
    pending_count: Arc<AtomicUsize>,
}

impl QueueStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(PENDING)?;
        write_txn.open_table(PROCESSING)?;
        write_txn.open_table(COMPLETED)?;
        write_txn.open_table(FAILED)?;
        write_txn.commit()?;

        // Count entries surviving from a previous run so waiters see them
        let pending_count = {
            let read_txn = db.begin_read()?;
            let pending = read_txn.open_table(PENDING)?;
            pending.len()? as usize
        };

        Ok(Self {
            db,
            notify: Arc::new(Notify::new()),
            pending_count: Arc::new(AtomicUsize::new(pending_count)),
        })
    }

    /// Insert a record into the pending partition under its ordering score.
    pub fn insert_pending(&self, score: u64, task_id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING)?;
            let key = format!("{:020}:{}", score, task_id);
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Atomically pop the lowest-score pending record into processing.
    ///
    /// The callback inspects the raw record and returns `Take(updated)` to
    /// accept it (typically stamping started_at/worker before it lands in
    /// processing), `Leave` to decline the head without consuming it, or an
    /// error to abort the transaction. Declined and errored pops leave the
    /// pending partition untouched.
    pub fn atomic_pop_pending<F>(&self, on_data: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&[u8]) -> Result<PopDecision>,
    {
        let write_txn = self.db.begin_write()?;

        let result = {
            let mut pending = write_txn.open_table(PENDING)?;

            let head = if let Some(first) = pending.first()? {
                let key = first.0.value().to_string();
                let data = first.1.value().to_vec();
                let task_id = key
                    .splitn(2, ':')
                    .nth(1)
                    .ok_or_else(|| anyhow!("Invalid composite key format: {}", key))?
                    .to_string();
                Some((key, task_id, data))
            } else {
                None
            };

            match head {
                Some((key, task_id, data)) => {
                    let decision = match on_data(&data) {
                        Ok(decision) => decision,
                        Err(e) => {
                            drop(pending);
                            write_txn.abort()?;
                            return Err(e);
                        }
                    };

                    match decision {
                        PopDecision::Take(updated) => {
                            pending.remove(key.as_str())?;
                            let mut processing = write_txn.open_table(PROCESSING)?;
                            processing.insert(task_id.as_str(), updated.as_slice())?;
                            Some(updated)
                        }
                        PopDecision::Leave => None,
                    }
                }
                None => None,
            }
        };

        if result.is_some() {
            write_txn.commit()?;
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
        } else {
            write_txn.abort()?;
        }

        Ok(result)
    }

    /// Move a record from processing back into pending, in one transaction.
    /// Used by the retry path and by stalled-task recovery.
    pub fn retry_into_pending(&self, task_id: &str, score: u64, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut processing = write_txn.open_table(PROCESSING)?;
            processing.remove(task_id)?;
        }
        {
            let mut pending = write_txn.open_table(PENDING)?;
            let key = format!("{:020}:{}", score, task_id);
            pending.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Move a record from processing to the completed partition.
    pub fn move_to_completed(&self, task_id: &str, data: &[u8]) -> Result<()> {
        self.finish(task_id, COMPLETED, data)
    }

    /// Move a record from processing to the terminal failed partition.
    pub fn move_to_failed(&self, task_id: &str, data: &[u8]) -> Result<()> {
        self.finish(task_id, FAILED, data)
    }

    fn finish(
        &self,
        task_id: &str,
        target: TableDefinition<&str, &[u8]>,
        data: &[u8],
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut processing = write_txn.open_table(PROCESSING)?;
            processing.remove(task_id)?;
        }
        {
            let mut table = write_txn.open_table(target)?;
            table.insert(task_id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_from_processing(&self, task_id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let processing = read_txn.open_table(PROCESSING)?;

        if let Some(data) = processing.get(task_id)? {
            Ok(Some(data.value().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Drop a record from processing without moving it anywhere.
    pub fn remove_from_processing(&self, task_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut processing = write_txn.open_table(PROCESSING)?;
            processing.remove(task_id)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn get_all_pending(&self) -> Result<Vec<Vec<u8>>> {
        self.collect(PENDING)
    }

    pub fn get_all_processing(&self) -> Result<Vec<Vec<u8>>> {
        self.collect(PROCESSING)
    }

    pub fn get_all_completed(&self) -> Result<Vec<Vec<u8>>> {
        self.collect(COMPLETED)
    }

    pub fn get_all_failed(&self) -> Result<Vec<Vec<u8>>> {
        self.collect(FAILED)
    }

    fn collect(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut records = Vec::new();

        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(value.value().to_vec());
        }

        Ok(records)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let read_txn = self.db.begin_read()?;
        Ok(QueueCounts {
            pending: read_txn.open_table(PENDING)?.len()? as usize,
            processing: read_txn.open_table(PROCESSING)?.len()? as usize,
            completed: read_txn.open_table(COMPLETED)?.len()? as usize,
            failed: read_txn.open_table(FAILED)?.len()? as usize,
        })
    }

    /// Remove completed records the `keep` predicate rejects.
    /// Returns how many were purged.
    pub fn purge_completed<F>(&self, keep: F) -> Result<usize>
    where
        F: Fn(&[u8]) -> bool,
    {
        let doomed: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let completed = read_txn.open_table(COMPLETED)?;
            let mut keys = Vec::new();
            for entry in completed.iter()? {
                let (key, value) = entry?;
                if !keep(value.value()) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };

        if doomed.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut completed = write_txn.open_table(COMPLETED)?;
            for key in &doomed {
                completed.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;

        Ok(doomed.len())
    }

    /// Wait until a pending record may be available.
    ///
    /// Checks the pending counter first so a notification fired before the
    /// wait started is not missed.
    pub async fn wait_for_task(&self) {
        if self.pending_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        self.notify.notified().await;
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::SeqCst) > 0
    }
}
