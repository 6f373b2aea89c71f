//! Worker main loop: admission control, dequeue, verify, dispatch.
//!
//! One logical loop per worker process. Executions are spawned onto a
//! tracked JoinSet - bounded in practice by the admission check against the
//! pool's busy count - so a slow browser job never blocks polling, and
//! shutdown can drain or abort whatever is still in flight.

use crate::models::{Envelope, Task, TaskPayload};
use crate::pool::{BrowserInstance, InstancePool, PoolError};
use crate::queue::{PriorityQueue, TaskFate};
use crate::security::{SignedTaskCodec, scan_task_data, validate_account_id};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    /// Sleep while the pool is saturated or the loop needs to back off.
    pub poll_interval: Duration,
    /// Blocking window for one dequeue call.
    pub dequeue_timeout: Duration,
    /// Hard ceiling on one task execution; on expiry the instance is marked
    /// unhealthy for eviction rather than reused.
    pub exec_timeout: Duration,
    pub maintenance_interval: Duration,
    /// How long shutdown waits for in-flight executions before aborting.
    pub shutdown_grace: Duration,
    /// Processing entries older than this are returned to pending at start.
    pub stall_threshold: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            dequeue_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(180),
            maintenance_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(300),
        }
    }
}

/// What the external handler reports for one executed task.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// The page-automation side of the fence. Invoked once per dispatched task
/// inside the scoped instance acquisition.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task, instance: &BrowserInstance) -> Result<HandlerOutcome>;
}

#[derive(Default)]
pub struct DispatchCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher {
    queue: Arc<PriorityQueue>,
    pool: Arc<InstancePool>,
    codec: Arc<SignedTaskCodec>,
    handler: Arc<dyn TaskHandler>,
    config: DispatcherConfig,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<PriorityQueue>,
        pool: Arc<InstancePool>,
        codec: Arc<SignedTaskCodec>,
        handler: Arc<dyn TaskHandler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            codec,
            handler,
            config,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        self.counters.clone()
    }

    /// Main loop. Returns after a shutdown signal once in-flight work has
    /// been drained (or aborted past the grace window) and the pool has
    /// persisted its sessions.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker_id = %self.config.worker_id, "Dispatcher started");

        match self.queue.recover_stalled(self.config.stall_threshold) {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Requeued tasks stranded by a previous run"),
            Err(e) => error!(error = %e, "Stalled-task recovery failed"),
        }

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.tick().await;

        loop {
            // harvest finished executions; panics are logged, never fatal
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!("Task execution panicked");
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = maintenance.tick() => self.run_maintenance(),
                cycled = self.cycle(&mut in_flight) => {
                    if let Err(e) = cycled {
                        error!(error = %e, "Dispatch cycle failed, backing off");
                        tokio::time::sleep(self.config.poll_interval * 5).await;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Dispatcher draining");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "Grace window elapsed, aborting in-flight executions"
            );
            in_flight.shutdown().await;
        }

        self.pool.shutdown().await;

        let totals = self.counters.snapshot();
        info!(
            worker_id = %self.config.worker_id,
            processed = totals.processed,
            failed = totals.failed,
            rejected = totals.rejected,
            "Dispatcher stopped"
        );
    }

    /// One poll cycle: admission check, dequeue, admit, spawn.
    async fn cycle(&self, in_flight: &mut JoinSet<()>) -> Result<()> {
        // Admission control: do not pull work the pool cannot serve right
        // now; it would sit untouched in the processing partition.
        let stats = self.pool.stats().await;
        if stats.busy >= stats.max {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        }

        let Some(record) = self
            .queue
            .dequeue(&self.config.worker_id, self.config.dequeue_timeout)
            .await?
        else {
            return Ok(());
        };

        let Some(task) = self.admit(record.envelope) else {
            return Ok(());
        };

        let queue = self.queue.clone();
        let pool = self.pool.clone();
        let handler = self.handler.clone();
        let counters = self.counters.clone();
        let exec_timeout = self.config.exec_timeout;

        in_flight.spawn(async move {
            execute_task(queue, pool, handler, counters, task, exec_timeout).await;
        });

        Ok(())
    }

    /// Verification gate. Signed tasks go through the codec; plain tasks
    /// (the retry path, or a trust-reduced producer) get field-level
    /// validation. Rejected tasks are discarded - a forged task retried is
    /// a forged task retried.
    fn admit(&self, envelope: Envelope) -> Option<Task> {
        let task = match envelope {
            Envelope::Signed(signed) => match self.codec.verify(&signed) {
                Ok(task) => task,
                Err(e) => {
                    return self.reject(&signed.task_id, "signature verification failed", &e.to_string());
                }
            },
            Envelope::Plain(task) => {
                if !validate_account_id(&task.account_id) {
                    return self.reject(&task.id, "invalid account_id", &task.account_id);
                }
                if let Some(path) = scan_task_data(&task.data) {
                    return self.reject(&task.id, "dangerous content", &path);
                }
                task
            }
        };

        if let Err(e) = TaskPayload::parse(task.task_type, &task.data) {
            return self.reject(&task.id, "malformed payload", &e.to_string());
        }

        debug!(task_id = %task.id, task_type = %task.task_type, "Task admitted");
        Some(task)
    }

    fn reject(&self, task_id: &str, reason: &str, detail: &str) -> Option<Task> {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        error!(
            event = "task_rejected",
            task_id = %task_id,
            reason,
            detail,
            worker_id = %self.config.worker_id,
            "Task rejected - dropping without retry"
        );
        if let Err(e) = self.queue.discard(task_id) {
            warn!(task_id = %task_id, error = %e, "Failed to discard rejected task");
        }
        None
    }

    /// Periodic housekeeping. A failed tick logs a warning and waits for
    /// the next one; it never takes the loop down.
    fn run_maintenance(&self) {
        let dropped = self.codec.gc_nonces();
        if dropped > 0 {
            debug!(dropped, "Nonce cache pruned");
        }
        match self.queue.purge_completed() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Completed partition purged"),
            Err(e) => warn!(error = %e, "Completed-partition purge failed"),
        }
    }
}

/// Execute one admitted task against its account's instance and report the
/// outcome back to the queue.
async fn execute_task(
    queue: Arc<PriorityQueue>,
    pool: Arc<InstancePool>,
    handler: Arc<dyn TaskHandler>,
    counters: Arc<DispatchCounters>,
    task: Task,
    exec_timeout: Duration,
) {
    let account_id = task.account_id.clone();
    let handler_task = task.clone();

    let result = pool
        .use_instance(&account_id, move |instance| async move {
            match tokio::time::timeout(exec_timeout, handler.execute(&handler_task, &instance)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    instance.mark_unhealthy();
                    Err(anyhow::anyhow!(
                        "execution timed out after {}s",
                        exec_timeout.as_secs()
                    ))
                }
            }
        })
        .await;

    match result {
        Ok(outcome) if outcome.success => {
            if let Err(e) = queue.complete(&task.id, outcome.data) {
                error!(task_id = %task.id, error = %e, "Failed to persist completion");
                return;
            }
            counters.processed.fetch_add(1, Ordering::Relaxed);
            info!(task_id = %task.id, task_type = %task.task_type, "Task completed");
        }
        Ok(outcome) => {
            let error = outcome
                .error
                .unwrap_or_else(|| "task reported failure".to_string());
            fail_task(&queue, &counters, &task, &error);
        }
        Err(e @ PoolError::Unavailable { .. }) => {
            // capacity condition, not a task-content problem
            warn!(task_id = %task.id, account_id = %account_id, "Instance unavailable, scheduling retry");
            fail_task(&queue, &counters, &task, &format!("unavailable: {}", e));
        }
        Err(PoolError::Engine(e)) => {
            fail_task(&queue, &counters, &task, &e.to_string());
        }
    }
}

fn fail_task(queue: &PriorityQueue, counters: &DispatchCounters, task: &Task, error: &str) {
    match queue.fail(task, error, true) {
        Ok(TaskFate::Retried { attempt, delay_ms }) => {
            info!(task_id = %task.id, attempt, delay_ms, "Task scheduled for retry");
        }
        Ok(TaskFate::Exhausted) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(task_id = %task.id, error = %error, "Task failed permanently");
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to persist task failure");
        }
    }
}
