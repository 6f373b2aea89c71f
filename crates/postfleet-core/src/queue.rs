//! Priority queue service over the storage partitions.
//!
//! Ordering key: `score = (MAX_PRIORITY - priority) * PRIORITY_BAND +
//! enqueue_time_us`, so higher priority dequeues first and equal priorities
//! dequeue FIFO. The band sits strictly above any microsecond timestamp,
//! which keeps the two components from bleeding into each other.

use crate::models::{
    Envelope, FinishedTask, MAX_PRIORITY, MIN_PRIORITY, QueuedTask, Task, TaskPayload,
};
use crate::security::{sanitize_string, scan_task_data, validate_account_id};
use anyhow::{Context, Result, bail};
use postfleet_storage::{PopDecision, QueueCounts, QueueStore};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PRIORITY_BAND: u64 = 10_000_000_000_000_000;

/// Poll cadence while the queue head is a delayed retry that is not yet
/// eligible (no notification will fire for it).
const DEFERRED_POLL: Duration = Duration::from_millis(250);

/// Exponent cap so the backoff multiplier cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub completed_ttl_ms: i64,
    pub retry_backoff_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            completed_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            retry_backoff_ms: 30_000,
        }
    }
}

/// Where a failed task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFate {
    Retried { attempt: u32, delay_ms: i64 },
    Exhausted,
}

pub struct PriorityQueue {
    store: QueueStore,
    config: QueueConfig,
}

impl PriorityQueue {
    pub fn new(store: QueueStore, config: QueueConfig) -> Self {
        Self { store, config }
    }

    fn score(priority: u8, at_us: i64) -> u64 {
        let band = (MAX_PRIORITY - priority.clamp(MIN_PRIORITY, MAX_PRIORITY)) as u64;
        band * PRIORITY_BAND + at_us as u64
    }

    /// Insert an envelope into the pending partition.
    ///
    /// This is the validation boundary: account pattern, dangerous-content
    /// scan and the per-type payload schema are all enforced here. Encrypted
    /// signed payloads carry only the sentinel, so their schema is checked
    /// after decryption on the worker side instead.
    pub fn enqueue(&self, envelope: Envelope) -> Result<String> {
        if !validate_account_id(envelope.account_id()) {
            bail!("Invalid account_id: {:?}", envelope.account_id());
        }
        if let Some(path) = scan_task_data(envelope.data()) {
            bail!("Dangerous content detected at {}", path);
        }

        let encrypted = matches!(&envelope, Envelope::Signed(signed) if signed.encrypted_payload.is_some());
        if !encrypted {
            TaskPayload::parse(envelope.task_type(), envelope.data())
                .with_context(|| format!("Rejecting task {}", envelope.task_id()))?;
        }

        let task_id = envelope.task_id().to_string();
        let priority = envelope.priority();
        let record = QueuedTask::new(envelope);

        let score = Self::score(priority, chrono::Utc::now().timestamp_micros());
        let data = serde_json::to_vec(&record)?;
        self.store.insert_pending(score, &task_id, &data)?;

        info!(task_id = %task_id, priority, "Task enqueued");
        Ok(task_id)
    }

    /// Atomically pop the highest-priority eligible task into processing,
    /// stamping it with the worker id and start time. Blocks up to `timeout`
    /// waiting for work.
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> Result<Option<QueuedTask>> {
        let deadline = Instant::now() + timeout;

        loop {
            let (record, deferred) = self.try_dequeue(worker_id)?;
            if let Some(record) = record {
                debug!(task_id = %record.envelope.task_id(), worker_id, "Task dequeued");
                return Ok(Some(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;

            if deferred {
                // Head exists but is not eligible yet; no wakeup will fire
                tokio::time::sleep(remaining.min(DEFERRED_POLL)).await;
            } else {
                tokio::select! {
                    _ = self.store.wait_for_task() => {}
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }

    fn try_dequeue(&self, worker_id: &str) -> Result<(Option<QueuedTask>, bool)> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut deferred = false;

        let popped = self.store.atomic_pop_pending(|data| {
            let mut record: QueuedTask =
                serde_json::from_slice(data).context("Corrupt pending record")?;

            if let Some(not_before) = record.not_before
                && not_before > now_ms
            {
                deferred = true;
                return Ok(PopDecision::Leave);
            }

            record.not_before = None;
            record.started_at = Some(now_ms);
            record.worker_id = Some(worker_id.to_string());
            Ok(PopDecision::Take(serde_json::to_vec(&record)?))
        })?;

        match popped {
            Some(bytes) => Ok((Some(serde_json::from_slice(&bytes)?), false)),
            None => Ok((None, deferred)),
        }
    }

    /// Move a task from processing into the completed partition.
    pub fn complete(&self, task_id: &str, result: Value) -> Result<()> {
        let Some(data) = self.store.get_from_processing(task_id)? else {
            warn!(task_id = %task_id, "Completion for task not in processing");
            return Ok(());
        };
        let record: QueuedTask = serde_json::from_slice(&data)?;

        let finished = FinishedTask::completed(record.envelope, result);
        self.store
            .move_to_completed(task_id, &serde_json::to_vec(&finished)?)?;

        info!(task_id = %task_id, "Task completed");
        Ok(())
    }

    /// The only automatic retry path.
    ///
    /// Increments `retry_count`; below `max_retries` the task re-enters
    /// pending as a plain envelope, one priority step lower, eligible after
    /// an exponential backoff. At the cap it moves to the terminal failed
    /// partition. Takes the verified plaintext task because the processing
    /// record may still hold ciphertext.
    pub fn fail(&self, task: &Task, error: &str, retry: bool) -> Result<TaskFate> {
        // error strings come straight from browser stderr; cap and clean
        // them before they enter the durable partitions
        let error = sanitize_string(error, 1000);
        let error = error.as_str();

        let mut retried = task.clone();
        retried.retry_count += 1;
        let attempt = retried.retry_count;

        if retry && attempt < self.config.max_retries {
            retried.priority = retried.priority.saturating_sub(1).max(MIN_PRIORITY);
            let delay_ms = self.backoff_ms(attempt);
            let eligible_at = chrono::Utc::now().timestamp_millis() + delay_ms;

            let mut record = QueuedTask::new(Envelope::Plain(retried.clone()));
            record.not_before = Some(eligible_at);
            record.last_error = Some(error.to_string());

            let score = Self::score(retried.priority, eligible_at * 1000);
            self.store
                .retry_into_pending(&task.id, score, &serde_json::to_vec(&record)?)?;

            info!(task_id = %task.id, attempt, delay_ms, error = %error, "Task requeued for retry");
            return Ok(TaskFate::Retried { attempt, delay_ms });
        }

        if !retry {
            // caller marked the failure terminal; keep the count as-is
            retried.retry_count = task.retry_count;
        }

        let finished = FinishedTask::failed(Envelope::Plain(retried), error.to_string());
        self.store
            .move_to_failed(&task.id, &serde_json::to_vec(&finished)?)?;

        warn!(task_id = %task.id, error = %error, "Task failed permanently");
        Ok(TaskFate::Exhausted)
    }

    fn backoff_ms(&self, attempt: u32) -> i64 {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.config.retry_backoff_ms.saturating_mul(1 << shift)
    }

    /// Drop a rejected (unverifiable) task from processing. It surfaces only
    /// through security logs, never through the result partitions.
    pub fn discard(&self, task_id: &str) -> Result<bool> {
        self.store.remove_from_processing(task_id)
    }

    /// Purge completed records older than the retention TTL.
    pub fn purge_completed(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.config.completed_ttl_ms;
        self.store.purge_completed(|data| {
            serde_json::from_slice::<FinishedTask>(data)
                .map(|finished| finished.finished_at >= cutoff)
                .unwrap_or(true)
        })
    }

    /// Return processing entries stamped longer ago than `threshold` to
    /// pending. Covers workers that crashed mid-task; redelivery is the
    /// at-least-once contract doing its job.
    pub fn recover_stalled(&self, threshold: Duration) -> Result<u32> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let threshold_ms = threshold.as_millis() as i64;
        let mut recovered = 0;

        for data in self.store.get_all_processing()? {
            let Ok(mut record) = serde_json::from_slice::<QueuedTask>(&data) else {
                continue;
            };
            let Some(started_at) = record.started_at else {
                continue;
            };
            if now_ms - started_at <= threshold_ms {
                continue;
            }

            let task_id = record.envelope.task_id().to_string();
            record.started_at = None;
            record.worker_id = None;

            let score = Self::score(record.envelope.priority(), now_ms * 1000);
            self.store
                .retry_into_pending(&task_id, score, &serde_json::to_vec(&record)?)?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Recovered stalled tasks");
        }
        Ok(recovered)
    }

    pub fn stats(&self) -> Result<QueueCounts> {
        self.store.counts()
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }
}
