//! Per-account browser instance pool.
//!
//! One account maps to at most one live instance, and an instance serves at
//! most one task at a time - that serialization is what keeps two
//! automations from racing on the same logged-in session. The instance map
//! sits behind a single mutex held across every check-then-act sequence
//! (lookup, capacity check, eviction, creation), so concurrent acquirers
//! cannot overshoot capacity or double-create an account's instance.

use anyhow::Result;
use async_trait::async_trait;
use postfleet_browser::{BrowserEngine, ContextHandle, ContextRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Transient capacity condition; the caller must treat this as
    /// retryable, not as a task failure.
    #[error("no instance available for {account_id}: {reason}")]
    Unavailable {
        account_id: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Unavailable { .. })
    }
}

/// Persisted session state, keyed by account. The pool never interprets the
/// blob; it only moves it between the store and the browser engine.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<Value>>;
    async fn save(&self, account_id: &str, state: &Value) -> Result<()>;
    async fn delete(&self, account_id: &str) -> Result<bool>;
}

#[async_trait]
impl SessionStore for postfleet_storage::SessionVault {
    async fn load(&self, account_id: &str) -> Result<Option<Value>> {
        postfleet_storage::SessionVault::load(self, account_id)
    }

    async fn save(&self, account_id: &str, state: &Value) -> Result<()> {
        postfleet_storage::SessionVault::save(self, account_id, state)
    }

    async fn delete(&self, account_id: &str) -> Result<bool> {
        postfleet_storage::SessionVault::delete(self, account_id)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub idle_timeout: Duration,
    pub probe_timeout: Duration,
    pub reap_interval: Duration,
    pub headless: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            idle_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(15),
            reap_interval: Duration::from_secs(60),
            headless: true,
        }
    }
}

/// One browsing context bound to one account. Flags are atomics so the
/// scoped-use guard can clear them without re-entering the pool lock.
#[derive(Debug)]
pub struct BrowserInstance {
    pub instance_id: String,
    pub account_id: String,
    pub context: ContextHandle,
    pub created_at: i64,
    last_activity: AtomicI64,
    task_count: AtomicU64,
    busy: AtomicBool,
    healthy: AtomicBool,
}

impl BrowserInstance {
    fn new(account_id: &str, context: ContextHandle) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            instance_id: format!("instance_{}", &Uuid::new_v4().simple().to_string()[..8]),
            account_id: account_id.to_string(),
            context,
            created_at: now,
            last_activity: AtomicI64::new(now),
            task_count: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn idle_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_activity.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Flag the instance for eviction instead of reuse. Called when a task
    /// execution times out and the context state can no longer be trusted.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct InstanceStat {
    pub instance_id: String,
    pub account_id: String,
    pub busy: bool,
    pub healthy: bool,
    pub task_count: u64,
    pub idle_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub max: usize,
    pub instances: Vec<InstanceStat>,
}

pub struct InstancePool {
    engine: Arc<dyn BrowserEngine>,
    sessions: Arc<dyn SessionStore>,
    instances: Mutex<HashMap<String, Arc<BrowserInstance>>>,
    config: PoolConfig,
}

impl InstancePool {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        sessions: Arc<dyn SessionStore>,
        config: PoolConfig,
    ) -> Self {
        Self {
            engine,
            sessions,
            instances: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn max_instances(&self) -> usize {
        self.config.max_instances
    }

    /// Acquire the account's instance, claiming it (busy) before the pool
    /// lock is released.
    ///
    /// `Unavailable` covers both a busy account instance and a full pool
    /// with nothing evictable; both are retry conditions for the caller.
    pub async fn acquire(&self, account_id: &str) -> Result<Arc<BrowserInstance>, PoolError> {
        let mut instances = self.instances.lock().await;

        if let Some(existing) = instances.get(account_id).cloned() {
            if existing.is_busy() {
                return Err(PoolError::Unavailable {
                    account_id: account_id.to_string(),
                    reason: "account instance busy",
                });
            }
            if existing.is_healthy() {
                existing.busy.store(true, Ordering::SeqCst);
                existing.touch();
                return Ok(existing);
            }

            debug!(account_id = %account_id, instance_id = %existing.instance_id, "Recreating unhealthy instance");
            instances.remove(account_id);
            self.teardown(&existing, "unhealthy").await;
        }

        if instances.len() >= self.config.max_instances {
            // Evict exactly one idle instance: oldest last_activity among
            // the non-busy ones. Accounts with infrequent traffic yield
            // capacity to active ones.
            let victim = instances
                .values()
                .filter(|instance| !instance.is_busy())
                .min_by_key(|instance| instance.last_activity.load(Ordering::SeqCst))
                .cloned();

            match victim {
                Some(victim) => {
                    instances.remove(&victim.account_id);
                    self.teardown(&victim, "capacity pressure").await;
                }
                None => {
                    warn!(
                        account_id = %account_id,
                        current = instances.len(),
                        max = self.config.max_instances,
                        "Instance pool at capacity"
                    );
                    return Err(PoolError::Unavailable {
                        account_id: account_id.to_string(),
                        reason: "pool at capacity",
                    });
                }
            }
        }

        // Creation stays inside the pool lock so two workers cannot race to
        // build duplicate instances for the same account.
        let storage_state = match self.sessions.load(account_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Session load failed, starting fresh");
                None
            }
        };
        let has_session = storage_state.is_some();

        let context = self
            .engine
            .open_context(&ContextRequest {
                account_id: account_id.to_string(),
                headless: self.config.headless,
                storage_state,
            })
            .await?;

        let instance = Arc::new(BrowserInstance::new(account_id, context));
        instance.busy.store(true, Ordering::SeqCst);
        instances.insert(account_id.to_string(), instance.clone());

        info!(
            account_id = %account_id,
            instance_id = %instance.instance_id,
            has_session,
            "Browser instance created"
        );
        Ok(instance)
    }

    /// Return an instance after use. `completed` marks a successful scoped
    /// block and bumps the task counter.
    pub fn release(&self, instance: &BrowserInstance, completed: bool) {
        if completed {
            instance.task_count.fetch_add(1, Ordering::SeqCst);
        }
        instance.touch();
        instance.busy.store(false, Ordering::SeqCst);
    }

    /// Run `f` against the account's instance. The busy flag is cleared and
    /// activity touched on every exit path, including `f` erroring or the
    /// future being dropped mid-await.
    pub async fn use_instance<F, Fut, T>(&self, account_id: &str, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<BrowserInstance>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let instance = self.acquire(account_id).await?;

        let guard = scopeguard::guard(instance.clone(), |instance| {
            instance.touch();
            instance.busy.store(false, Ordering::SeqCst);
        });

        let result = f(instance.clone()).await;
        if result.is_ok() {
            instance.task_count.fetch_add(1, Ordering::SeqCst);
        }
        drop(guard);

        result.map_err(PoolError::Engine)
    }

    /// Best-effort session save, then context destruction. Failures are
    /// logged and swallowed; eviction must always make progress.
    async fn teardown(&self, instance: &BrowserInstance, reason: &str) {
        match self.engine.storage_state(&instance.context).await {
            Ok(Some(state)) => {
                if let Err(e) = self.sessions.save(&instance.account_id, &state).await {
                    warn!(account_id = %instance.account_id, error = %e, "Failed to persist session on teardown");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(account_id = %instance.account_id, error = %e, "Failed to read storage state on teardown");
            }
        }

        if let Err(e) = self.engine.close_context(&instance.context).await {
            warn!(instance_id = %instance.instance_id, error = %e, "Failed to close browser context");
        }

        info!(
            instance_id = %instance.instance_id,
            account_id = %instance.account_id,
            task_count = instance.task_count(),
            reason,
            "Browser instance evicted"
        );
    }

    /// Evict a specific account's instance if it is present and not busy.
    async fn evict(&self, account_id: &str, reason: &str) {
        let mut instances = self.instances.lock().await;
        let Some(instance) = instances.get(account_id).cloned() else {
            return;
        };
        if instance.is_busy() {
            return;
        }
        instances.remove(account_id);
        self.teardown(&instance, reason).await;
    }

    /// One reaper pass: evict idle-beyond-timeout instances, then probe the
    /// remaining non-busy ones and evict probe failures. Probes are
    /// time-bounded so a hung context cannot stall the pass.
    pub async fn reap(&self) {
        let candidates: Vec<Arc<BrowserInstance>> = {
            let instances = self.instances.lock().await;
            instances
                .values()
                .filter(|instance| !instance.is_busy())
                .cloned()
                .collect()
        };

        for instance in candidates {
            if instance.is_busy() {
                continue;
            }

            if instance.idle_ms() > self.config.idle_timeout.as_millis() as i64 {
                self.evict(&instance.account_id, "idle timeout").await;
                continue;
            }

            if !instance.is_healthy() {
                self.evict(&instance.account_id, "marked unhealthy").await;
                continue;
            }

            let alive = tokio::time::timeout(
                self.config.probe_timeout,
                self.engine.ping(&instance.context),
            )
            .await
            .unwrap_or(false);

            if !alive {
                instance.mark_unhealthy();
                self.evict(&instance.account_id, "failed liveness probe").await;
            }
        }
    }

    /// Background reaper loop. A failed pass is logged by `reap` internals
    /// and retried on the next tick; it never takes the process down.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it
        ticker.tick().await;

        info!(interval_secs = self.config.reap_interval.as_secs(), "Instance reaper started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => self.reap().await,
            }
        }
        info!("Instance reaper stopped");
    }

    /// Drain every instance through the save-then-destroy path.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<BrowserInstance>> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, instance)| instance).collect()
        };

        info!(count = drained.len(), "Shutting down instance pool");
        for instance in drained {
            self.teardown(&instance, "shutdown").await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let instances = self.instances.lock().await;
        let mut stats = PoolStats {
            total: instances.len(),
            busy: 0,
            idle: 0,
            max: self.config.max_instances,
            instances: Vec::with_capacity(instances.len()),
        };

        for instance in instances.values() {
            let busy = instance.is_busy();
            if busy {
                stats.busy += 1;
            } else {
                stats.idle += 1;
            }
            stats.instances.push(InstanceStat {
                instance_id: instance.instance_id.clone(),
                account_id: instance.account_id.clone(),
                busy,
                healthy: instance.is_healthy(),
                task_count: instance.task_count(),
                idle_secs: instance.idle_ms() / 1000,
            });
        }

        stats
    }
}
