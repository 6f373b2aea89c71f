//! Shared test doubles for the pool and dispatcher tests.

use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::models::Task;
use crate::pool::{BrowserInstance, SessionStore};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use postfleet_browser::{
    ActionReport, BrowserAction, BrowserEngine, ContextHandle, ContextRequest, EngineProbe,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// In-memory engine: no processes, no filesystem.
pub struct MockEngine {
    open_calls: AtomicUsize,
    ping_ok: AtomicBool,
    closed: Mutex<Vec<String>>,
    last_seed: Mutex<Option<Value>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            open_calls: AtomicUsize::new(0),
            ping_ok: AtomicBool::new(true),
            closed: Mutex::new(Vec::new()),
            last_seed: Mutex::new(None),
        }
    }
}

impl MockEngine {
    pub fn open_count(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Account ids whose contexts were closed, in order.
    pub fn closed_accounts(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn last_seed(&self) -> Option<Value> {
        self.last_seed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserEngine for MockEngine {
    async fn probe(&self) -> Result<EngineProbe> {
        Ok(EngineProbe {
            node_available: true,
            node_version: Some("v22.0.0".to_string()),
            playwright_package_available: true,
            chromium_cache_detected: true,
            ready: true,
            notes: Vec::new(),
        })
    }

    async fn open_context(&self, request: &ContextRequest) -> Result<ContextHandle> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_seed.lock().unwrap() = request.storage_state.clone();

        let id = Uuid::new_v4().to_string();
        Ok(ContextHandle {
            id: id.clone(),
            account_id: request.account_id.clone(),
            headless: request.headless,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            profile_dir: format!("/mock/{}/profile", id),
            artifacts_dir: format!("/mock/{}/artifacts", id),
        })
    }

    async fn run_actions(
        &self,
        _ctx: &ContextHandle,
        actions: &[BrowserAction],
        _timeout_secs: u64,
    ) -> Result<ActionReport> {
        Ok(ActionReport {
            exit_code: 0,
            duration_ms: 1,
            stdout: String::new(),
            stderr: String::new(),
            payload: Some(json!({"success": true, "result": actions.len()})),
        })
    }

    async fn storage_state(&self, ctx: &ContextHandle) -> Result<Option<Value>> {
        Ok(Some(json!({"cookies": [], "account": ctx.account_id})))
    }

    async fn ping(&self, _ctx: &ContextHandle) -> bool {
        self.ping_ok.load(Ordering::SeqCst)
    }

    async fn close_context(&self, ctx: &ContextHandle) -> Result<()> {
        self.closed.lock().unwrap().push(ctx.account_id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSessionStore {
    seeded: Mutex<HashMap<String, Value>>,
    saved: Mutex<HashMap<String, Value>>,
}

impl MockSessionStore {
    pub fn seed(&self, account_id: &str, state: Value) {
        self.seeded.lock().unwrap().insert(account_id.to_string(), state);
    }

    pub fn saved_for(&self, account_id: &str) -> bool {
        self.saved.lock().unwrap().contains_key(account_id)
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn load(&self, account_id: &str) -> Result<Option<Value>> {
        Ok(self.seeded.lock().unwrap().get(account_id).cloned())
    }

    async fn save(&self, account_id: &str, state: &Value) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .insert(account_id.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, account_id: &str) -> Result<bool> {
        let seeded = self.seeded.lock().unwrap().remove(account_id).is_some();
        let saved = self.saved.lock().unwrap().remove(account_id).is_some();
        Ok(seeded || saved)
    }
}

/// How the scripted handler should behave for a given task.
#[derive(Debug, Clone, Copy)]
pub enum HandlerMode {
    Succeed,
    BusinessFail,
    Error,
    Hang(Duration),
}

pub struct ScriptedHandler {
    mode: Mutex<HandlerMode>,
    pub calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(mode: HandlerMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: HandlerMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn execute(&self, task: &Task, _instance: &BrowserInstance) -> Result<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            HandlerMode::Succeed => Ok(HandlerOutcome::success(
                json!({"task_id": task.id, "done": true}),
            )),
            HandlerMode::BusinessFail => Ok(HandlerOutcome::failure("element not found")),
            HandlerMode::Error => Err(anyhow!("browser crashed")),
            HandlerMode::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(HandlerOutcome::success(json!({"late": true})))
            }
        }
    }
}
