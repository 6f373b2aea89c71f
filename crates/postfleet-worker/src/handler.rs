//! Built-in handler for session-maintenance tasks.
//!
//! Listing automation (posting, updating, deleting) is site-specific and
//! lives outside this binary; tasks of those types fail with a
//! missing-handler error. Session validation and refresh are generic enough
//! to ship here: navigate the portal, let the context re-establish its
//! cookies, persist the refreshed state.

use anyhow::Result;
use async_trait::async_trait;
use postfleet_browser::{BrowserAction, BrowserEngine};
use postfleet_core::dispatcher::{HandlerOutcome, TaskHandler};
use postfleet_core::models::{Task, TaskPayload};
use postfleet_core::pool::{BrowserInstance, SessionStore};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

const JOB_TIMEOUT_SECS: u64 = 60;

pub struct MaintenanceHandler {
    engine: Arc<dyn BrowserEngine>,
    sessions: Arc<dyn SessionStore>,
    portal_url: String,
}

impl MaintenanceHandler {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        sessions: Arc<dyn SessionStore>,
        portal_url: String,
    ) -> Self {
        Self {
            engine,
            sessions,
            portal_url,
        }
    }

    async fn validate_session(
        &self,
        task: &Task,
        instance: &BrowserInstance,
    ) -> Result<HandlerOutcome> {
        if !self.engine.ping(&instance.context).await {
            return Ok(HandlerOutcome::failure("browser context unresponsive"));
        }

        let report = self
            .engine
            .run_actions(
                &instance.context,
                &[BrowserAction::Navigate {
                    url: self.portal_url.clone(),
                    wait_until: None,
                }],
                JOB_TIMEOUT_SECS,
            )
            .await?;
        if !report.succeeded() {
            return Ok(HandlerOutcome::failure(report.failure_message()));
        }

        let state = self.engine.storage_state(&instance.context).await?;
        let session_valid = state.as_ref().map(has_cookies).unwrap_or(false);

        if let Some(state) = &state {
            self.persist(&task.account_id, state).await;
        }

        Ok(HandlerOutcome::success(json!({
            "account_id": task.account_id,
            "session_valid": session_valid,
        })))
    }

    async fn refresh_session(
        &self,
        task: &Task,
        instance: &BrowserInstance,
    ) -> Result<HandlerOutcome> {
        let report = self
            .engine
            .run_actions(
                &instance.context,
                &[BrowserAction::Navigate {
                    url: self.portal_url.clone(),
                    wait_until: None,
                }],
                JOB_TIMEOUT_SECS,
            )
            .await?;
        if !report.succeeded() {
            return Ok(HandlerOutcome::failure(report.failure_message()));
        }

        let Some(state) = self.engine.storage_state(&instance.context).await? else {
            return Ok(HandlerOutcome::failure(
                "context exported no session state to save",
            ));
        };
        self.persist(&task.account_id, &state).await;

        info!(account_id = %task.account_id, "Session refreshed");
        Ok(HandlerOutcome::success(json!({
            "account_id": task.account_id,
            "refreshed": true,
        })))
    }

    async fn persist(&self, account_id: &str, state: &Value) {
        if let Err(e) = self.sessions.save(account_id, state).await {
            warn!(account_id = %account_id, error = %e, "Failed to persist session state");
        }
    }
}

fn has_cookies(state: &Value) -> bool {
    state
        .get("cookies")
        .and_then(Value::as_array)
        .map(|cookies| !cookies.is_empty())
        .unwrap_or(false)
}

#[async_trait]
impl TaskHandler for MaintenanceHandler {
    async fn execute(&self, task: &Task, instance: &BrowserInstance) -> Result<HandlerOutcome> {
        match TaskPayload::parse(task.task_type, &task.data) {
            Ok(TaskPayload::ValidateSession) => self.validate_session(task, instance).await,
            Ok(TaskPayload::RefreshSession) => self.refresh_session(task, instance).await,
            Ok(_) => Ok(HandlerOutcome::failure(format!(
                "no handler installed for task type {}",
                task.task_type
            ))),
            Err(e) => Ok(HandlerOutcome::failure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postfleet_browser::{ActionReport, ContextHandle, ContextRequest, EngineProbe};
    use postfleet_core::models::TaskType;
    use postfleet_core::pool::{InstancePool, PoolConfig};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubEngine {
        ping_ok: AtomicBool,
        navigate_ok: AtomicBool,
        exported_state: Mutex<Option<Value>>,
    }

    impl Default for StubEngine {
        fn default() -> Self {
            Self {
                ping_ok: AtomicBool::new(true),
                navigate_ok: AtomicBool::new(true),
                exported_state: Mutex::new(Some(json!({
                    "cookies": [{"name": "sid", "value": "ok"}]
                }))),
            }
        }
    }

    #[async_trait]
    impl BrowserEngine for StubEngine {
        async fn probe(&self) -> Result<EngineProbe> {
            Ok(EngineProbe {
                node_available: true,
                node_version: None,
                playwright_package_available: true,
                chromium_cache_detected: true,
                ready: true,
                notes: Vec::new(),
            })
        }

        async fn open_context(&self, request: &ContextRequest) -> Result<ContextHandle> {
            Ok(ContextHandle {
                id: "ctx".to_string(),
                account_id: request.account_id.clone(),
                headless: true,
                created_at_ms: 0,
                profile_dir: "/stub/profile".to_string(),
                artifacts_dir: "/stub/artifacts".to_string(),
            })
        }

        async fn run_actions(
            &self,
            _ctx: &ContextHandle,
            _actions: &[BrowserAction],
            _timeout_secs: u64,
        ) -> Result<ActionReport> {
            let ok = self.navigate_ok.load(Ordering::SeqCst);
            Ok(ActionReport {
                exit_code: if ok { 0 } else { 1 },
                duration_ms: 1,
                stdout: String::new(),
                stderr: String::new(),
                payload: Some(if ok {
                    json!({"success": true, "result": []})
                } else {
                    json!({"success": false, "error": "net::ERR_CONNECTION_REFUSED"})
                }),
            })
        }

        async fn storage_state(&self, _ctx: &ContextHandle) -> Result<Option<Value>> {
            Ok(self.exported_state.lock().unwrap().clone())
        }

        async fn ping(&self, _ctx: &ContextHandle) -> bool {
            self.ping_ok.load(Ordering::SeqCst)
        }

        async fn close_context(&self, _ctx: &ContextHandle) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubSessions {
        saved: Mutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl SessionStore for StubSessions {
        async fn load(&self, _account_id: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn save(&self, account_id: &str, state: &Value) -> Result<()> {
            self.saved
                .lock()
                .unwrap()
                .insert(account_id.to_string(), state.clone());
            Ok(())
        }

        async fn delete(&self, _account_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    async fn run(
        engine: Arc<StubEngine>,
        sessions: Arc<StubSessions>,
        task_type: TaskType,
    ) -> HandlerOutcome {
        let handler = MaintenanceHandler::new(
            engine.clone(),
            sessions.clone(),
            "https://portal.example.com".to_string(),
        );
        let pool = InstancePool::new(engine, sessions, PoolConfig::default());
        let instance = pool.acquire("acct_1").await.unwrap();

        let task = Task::new(task_type, "acct_1", json!({}));
        handler.execute(&task, &instance).await.unwrap()
    }

    #[tokio::test]
    async fn validate_session_reports_valid_and_persists() {
        let engine = Arc::new(StubEngine::default());
        let sessions = Arc::new(StubSessions::default());

        let outcome = run(engine, sessions.clone(), TaskType::ValidateSession).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["session_valid"], true);
        assert!(sessions.saved.lock().unwrap().contains_key("acct_1"));
    }

    #[tokio::test]
    async fn validate_session_flags_cookieless_state() {
        let engine = Arc::new(StubEngine::default());
        *engine.exported_state.lock().unwrap() = Some(json!({"cookies": []}));
        let sessions = Arc::new(StubSessions::default());

        let outcome = run(engine, sessions, TaskType::ValidateSession).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["session_valid"], false);
    }

    #[tokio::test]
    async fn unresponsive_context_fails_validation() {
        let engine = Arc::new(StubEngine::default());
        engine.ping_ok.store(false, Ordering::SeqCst);
        let sessions = Arc::new(StubSessions::default());

        let outcome = run(engine, sessions, TaskType::ValidateSession).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unresponsive"));
    }

    #[tokio::test]
    async fn refresh_session_saves_state() {
        let engine = Arc::new(StubEngine::default());
        let sessions = Arc::new(StubSessions::default());

        let outcome = run(engine, sessions.clone(), TaskType::RefreshSession).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["refreshed"], true);
        assert!(sessions.saved.lock().unwrap().contains_key("acct_1"));
    }

    #[tokio::test]
    async fn refresh_failure_propagates_navigation_error() {
        let engine = Arc::new(StubEngine::default());
        engine.navigate_ok.store(false, Ordering::SeqCst);
        let sessions = Arc::new(StubSessions::default());

        let outcome = run(engine, sessions, TaskType::RefreshSession).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("ERR_CONNECTION_REFUSED"));
    }

    #[tokio::test]
    async fn listing_tasks_report_missing_handler() {
        let engine = Arc::new(StubEngine::default());
        let sessions = Arc::new(StubSessions::default());

        let handler = MaintenanceHandler::new(
            engine.clone(),
            sessions.clone(),
            "https://portal.example.com".to_string(),
        );
        let pool = InstancePool::new(engine, sessions, PoolConfig::default());
        let instance = pool.acquire("acct_1").await.unwrap();

        let task = Task::new(
            TaskType::PostVehicle,
            "acct_1",
            json!({"vehicle": {"price": 100}}),
        );
        let outcome = handler.execute(&task, &instance).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("post_vehicle"));
    }
}
