//! Chromium automation seam for postfleet workers.
//!
//! Each browser context is bound to exactly one account and carries that
//! account's storage state (cookies, local storage) across jobs. The crate
//! exposes:
//! - the [`BrowserEngine`] trait the instance pool drives
//! - a Playwright-over-Node implementation that runs one Chromium job per
//!   action plan, seeding and re-exporting storage state around it
//! - structured [`BrowserAction`] plans for common page workflows
//! - runtime probing for the Node/Playwright prerequisites

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

const RESULT_MARKER: &str = "__POSTFLEET_RESULT__=";
const PING_TIMEOUT_SECS: u64 = 15;

/// What the local runtime can actually do, with actionable notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineProbe {
    pub node_available: bool,
    pub node_version: Option<String>,
    pub playwright_package_available: bool,
    pub chromium_cache_detected: bool,
    pub ready: bool,
    pub notes: Vec<String>,
}

impl EngineProbe {
    fn empty() -> Self {
        Self {
            node_available: false,
            node_version: None,
            playwright_package_available: false,
            chromium_cache_detected: false,
            ready: false,
            notes: Vec::new(),
        }
    }
}

/// Request to open an account-bound browsing context.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub account_id: String,
    pub headless: bool,
    /// Persisted storage state to seed the context with. Absent means the
    /// account starts from a clean profile (fresh login required).
    pub storage_state: Option<Value>,
}

/// An open browsing context. The pool owns the handle; the engine owns the
/// on-disk profile it points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHandle {
    pub id: String,
    pub account_id: String,
    pub headless: bool,
    pub created_at_ms: i64,
    pub profile_dir: String,
    pub artifacts_dir: String,
}

/// One step of a structured page workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: Option<String>,
    },
    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Fill {
        selector: String,
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        delay_ms: Option<u64>,
    },
    Press {
        key: String,
        #[serde(default)]
        selector: Option<String>,
    },
    WaitForSelector {
        selector: String,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ExtractText {
        selector: String,
        #[serde(default)]
        all: bool,
    },
    Screenshot {
        path: String,
        #[serde(default)]
        full_page: bool,
    },
    Evaluate {
        expression: String,
    },
}

/// Outcome of one browser job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub payload: Option<Value>,
}

impl ActionReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
            && self
                .payload
                .as_ref()
                .and_then(|p| p.get("success"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    pub fn failure_message(&self) -> String {
        if let Some(payload) = &self.payload
            && let Some(error) = payload.get("error").and_then(Value::as_str)
        {
            return error.to_string();
        }

        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }

        format!("Browser job failed with exit code {}", self.exit_code)
    }
}

/// The driver seam between the instance pool and an actual browser runtime.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn probe(&self) -> Result<EngineProbe>;

    async fn open_context(&self, request: &ContextRequest) -> Result<ContextHandle>;

    async fn run_actions(
        &self,
        ctx: &ContextHandle,
        actions: &[BrowserAction],
        timeout_secs: u64,
    ) -> Result<ActionReport>;

    /// Current storage state of the context, if any job exported one yet.
    async fn storage_state(&self, ctx: &ContextHandle) -> Result<Option<Value>>;

    /// Time-bounded liveness probe. `false` means the context should be
    /// considered corrupt and evicted.
    async fn ping(&self, ctx: &ContextHandle) -> bool;

    async fn close_context(&self, ctx: &ContextHandle) -> Result<()>;
}

/// Playwright implementation: one Node subprocess per job, Chromium state
/// carried between jobs via the context's storage-state file.
pub struct PlaywrightEngine {
    root_dir: PathBuf,
}

impl PlaywrightEngine {
    pub fn new(root_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    /// Resolve the default profile root: `$POSTFLEET_BROWSER_DIR` or
    /// `.postfleet-browser` under the working directory.
    pub fn with_default_root() -> Result<Self> {
        if let Ok(path) = std::env::var("POSTFLEET_BROWSER_DIR") {
            return Self::new(PathBuf::from(path));
        }
        let base = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        Self::new(base.join(".postfleet-browser"))
    }

    fn state_path(ctx: &ContextHandle) -> PathBuf {
        PathBuf::from(&ctx.profile_dir).join("storage-state.json")
    }
}

#[async_trait]
impl BrowserEngine for PlaywrightEngine {
    async fn probe(&self) -> Result<EngineProbe> {
        let mut probe = EngineProbe::empty();

        let node_probe = run_command_capture("node", &["--version".to_string()], None, 10).await;
        if let Ok(output) = node_probe
            && output.exit_code == 0
        {
            probe.node_available = true;
            probe.node_version = Some(output.stdout.trim().to_string());
        }

        if probe.node_available {
            let playwright_probe = run_command_capture(
                "node",
                &[
                    "--input-type=module".to_string(),
                    "-e".to_string(),
                    "import('playwright').then(() => process.exit(0)).catch(() => process.exit(1));"
                        .to_string(),
                ],
                None,
                15,
            )
            .await;
            probe.playwright_package_available = playwright_probe
                .map(|output| output.exit_code == 0)
                .unwrap_or(false);
        }

        probe.chromium_cache_detected = detect_chromium_cache();
        probe.ready = probe.node_available && probe.playwright_package_available;

        if !probe.node_available {
            probe.notes.push(
                "Node.js not found. Install Node.js 20+ to enable the browser runtime.".to_string(),
            );
        }
        if probe.node_available && !probe.playwright_package_available {
            probe
                .notes
                .push("Playwright npm package not found. Run: npm i -D playwright".to_string());
        }
        if probe.ready && !probe.chromium_cache_detected {
            probe.notes.push(
                "Chromium binary not found in the Playwright cache. Run: npx playwright install chromium"
                    .to_string(),
            );
        }

        Ok(probe)
    }

    async fn open_context(&self, request: &ContextRequest) -> Result<ContextHandle> {
        let id = Uuid::new_v4().to_string();
        let context_dir = self.root_dir.join(&id);
        let profile_dir = context_dir.join("profile");
        let artifacts_dir = context_dir.join("artifacts");

        std::fs::create_dir_all(&profile_dir)?;
        std::fs::create_dir_all(&artifacts_dir)?;

        let ctx = ContextHandle {
            id,
            account_id: request.account_id.clone(),
            headless: request.headless,
            created_at_ms: Utc::now().timestamp_millis(),
            profile_dir: profile_dir.display().to_string(),
            artifacts_dir: artifacts_dir.display().to_string(),
        };

        if let Some(state) = &request.storage_state {
            std::fs::write(Self::state_path(&ctx), serde_json::to_vec(state)?)?;
        }

        debug!(context_id = %ctx.id, account_id = %ctx.account_id, "Browser context opened");
        Ok(ctx)
    }

    async fn run_actions(
        &self,
        ctx: &ContextHandle,
        actions: &[BrowserAction],
        timeout_secs: u64,
    ) -> Result<ActionReport> {
        let script = build_action_script(ctx, actions)?;
        run_node_job(script, timeout_secs.max(1)).await
    }

    async fn storage_state(&self, ctx: &ContextHandle) -> Result<Option<Value>> {
        let path = Self::state_path(ctx);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn ping(&self, ctx: &ContextHandle) -> bool {
        let script = build_ping_script(ctx);
        match run_node_job(script, PING_TIMEOUT_SECS).await {
            Ok(report) => report.succeeded(),
            Err(e) => {
                warn!(context_id = %ctx.id, error = %e, "Browser ping failed");
                false
            }
        }
    }

    async fn close_context(&self, ctx: &ContextHandle) -> Result<()> {
        let context_dir = self.root_dir.join(&ctx.id);
        if context_dir.exists() {
            std::fs::remove_dir_all(context_dir)?;
        }
        debug!(context_id = %ctx.id, account_id = %ctx.account_id, "Browser context closed");
        Ok(())
    }
}

/// Common prologue: import playwright, launch Chromium, open a context
/// seeded from the storage-state file if one exists.
fn script_prologue(ctx: &ContextHandle) -> String {
    let context_literal = json!({
        "id": ctx.id,
        "headless": ctx.headless,
        "profileDir": ctx.profile_dir,
        "artifactsDir": ctx.artifacts_dir,
    })
    .to_string();

    let mut script = String::new();
    script.push_str("import fs from 'node:fs';\n");
    script.push_str("import path from 'node:path';\n\n");
    script.push_str(&format!("const RESULT_MARKER = '{}';\n", RESULT_MARKER));
    script.push_str(&format!("const ctx = {};\n", context_literal));
    script.push_str("const storageStatePath = path.join(ctx.profileDir, 'storage-state.json');\n");
    script.push_str("const fail = (error) => {\n");
    script.push_str("  const message = error && error.stack ? error.stack : String(error);\n");
    script.push_str("  process.stderr.write(message + '\\n');\n");
    script.push_str("  process.stdout.write(`${RESULT_MARKER}${JSON.stringify({ success: false, error: message })}\\n`);\n");
    script.push_str("  process.exitCode = 1;\n");
    script.push_str("};\n\n");

    script.push_str("let chromium;\n");
    script.push_str("try {\n");
    script.push_str("  ({ chromium } = await import('playwright'));\n");
    script.push_str("} catch (error) {\n");
    script.push_str("  fail(error);\n");
    script.push_str("  process.exit();\n");
    script.push_str("}\n\n");

    script.push_str("const browser = await chromium.launch({ headless: ctx.headless });\n");
    script.push_str("const contextOptions = {};\n");
    script.push_str("if (fs.existsSync(storageStatePath)) {\n");
    script.push_str("  contextOptions.storageState = storageStatePath;\n");
    script.push_str("}\n");
    script.push_str("const context = await browser.newContext(contextOptions);\n");
    script.push_str("const page = await context.newPage();\n\n");

    script
}

fn script_epilogue() -> &'static str {
    "finally {\n  await context.close().catch(() => {});\n  await browser.close().catch(() => {});\n}\n"
}

fn build_ping_script(ctx: &ContextHandle) -> String {
    let mut script = script_prologue(ctx);
    script.push_str("try {\n");
    script.push_str("  const state = await page.evaluate(() => document.readyState);\n");
    script.push_str("  process.stdout.write(`${RESULT_MARKER}${JSON.stringify({ success: true, result: state })}\\n`);\n");
    script.push_str("} catch (error) {\n");
    script.push_str("  fail(error);\n");
    script.push_str("} ");
    script.push_str(script_epilogue());
    script
}

fn build_action_script(ctx: &ContextHandle, actions: &[BrowserAction]) -> Result<String> {
    let actions_literal = serde_json::to_string(actions)?;

    let mut script = script_prologue(ctx);
    script.push_str(&format!("const actions = {};\n\n", actions_literal));

    script.push_str("async function executeAction(action) {\n");
    script.push_str("  const timeoutMs = action.timeout_ms ?? 10000;\n");
    script.push_str("  switch (action.type) {\n");
    script.push_str("    case 'navigate': {\n");
    script.push_str(
        "      await page.goto(action.url, { waitUntil: action.wait_until ?? 'load' });\n",
    );
    script.push_str("      return { type: action.type, url: action.url };\n");
    script.push_str("    }\n");
    script.push_str("    case 'click': {\n");
    script.push_str("      const locator = page.locator(action.selector).first();\n");
    script.push_str("      await locator.waitFor({ state: 'visible', timeout: timeoutMs });\n");
    script.push_str("      await locator.click({ timeout: timeoutMs });\n");
    script.push_str("      return { type: action.type, selector: action.selector };\n");
    script.push_str("    }\n");
    script.push_str("    case 'fill': {\n");
    script.push_str("      const locator = page.locator(action.selector).first();\n");
    script.push_str("      await locator.waitFor({ state: 'visible', timeout: timeoutMs });\n");
    script.push_str("      await locator.fill(action.text, { timeout: timeoutMs });\n");
    script.push_str("      return { type: action.type, selector: action.selector };\n");
    script.push_str("    }\n");
    script.push_str("    case 'type': {\n");
    script.push_str("      const locator = page.locator(action.selector).first();\n");
    script.push_str("      await locator.waitFor({ state: 'visible', timeout: timeoutMs });\n");
    script.push_str(
        "      await locator.type(action.text, { delay: action.delay_ms ?? 0, timeout: timeoutMs });\n",
    );
    script.push_str("      return { type: action.type, selector: action.selector };\n");
    script.push_str("    }\n");
    script.push_str("    case 'press': {\n");
    script.push_str("      if (action.selector) {\n");
    script.push_str("        const locator = page.locator(action.selector).first();\n");
    script.push_str("        await locator.waitFor({ state: 'visible', timeout: timeoutMs });\n");
    script.push_str("        await locator.press(action.key, { timeout: timeoutMs });\n");
    script.push_str("      } else {\n");
    script.push_str("        await page.keyboard.press(action.key);\n");
    script.push_str("      }\n");
    script.push_str("      return { type: action.type, key: action.key };\n");
    script.push_str("    }\n");
    script.push_str("    case 'wait_for_selector': {\n");
    script.push_str("      const locator = page.locator(action.selector).first();\n");
    script.push_str(
        "      await locator.waitFor({ state: action.state ?? 'visible', timeout: timeoutMs });\n",
    );
    script.push_str("      return { type: action.type, selector: action.selector };\n");
    script.push_str("    }\n");
    script.push_str("    case 'extract_text': {\n");
    script.push_str("      if (action.all) {\n");
    script.push_str(
        "        const values = await page.locator(action.selector).allTextContents();\n",
    );
    script.push_str(
        "        return { type: action.type, selector: action.selector, value: values };\n",
    );
    script.push_str("      }\n");
    script.push_str(
        "      const value = await page.locator(action.selector).first().textContent();\n",
    );
    script.push_str("      return { type: action.type, selector: action.selector, value };\n");
    script.push_str("    }\n");
    script.push_str("    case 'screenshot': {\n");
    script.push_str(
        "      const target = path.isAbsolute(action.path) ? action.path : path.join(ctx.artifactsDir, action.path);\n",
    );
    script.push_str("      await fs.promises.mkdir(path.dirname(target), { recursive: true });\n");
    script.push_str(
        "      await page.screenshot({ path: target, fullPage: action.full_page ?? false });\n",
    );
    script.push_str("      return { type: action.type, path: target };\n");
    script.push_str("    }\n");
    script.push_str("    case 'evaluate': {\n");
    script.push_str(
        "      const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;\n",
    );
    script.push_str("      let value;\n");
    script.push_str("      try {\n");
    script.push_str(
        "        const exprFn = new AsyncFunction('page', 'context', `return (${action.expression});`);\n",
    );
    script.push_str("        value = await exprFn(page, context);\n");
    script.push_str("      } catch (_) {\n");
    script.push_str(
        "        const stmtFn = new AsyncFunction('page', 'context', action.expression);\n",
    );
    script.push_str("        value = await stmtFn(page, context);\n");
    script.push_str("      }\n");
    script.push_str("      return { type: action.type, value };\n");
    script.push_str("    }\n");
    script.push_str("    default:\n");
    script.push_str("      throw new Error(`Unsupported action type: ${action.type}`);\n");
    script.push_str("  }\n");
    script.push_str("}\n\n");

    script.push_str("const outputs = [];\n");
    script.push_str("try {\n");
    script.push_str("  for (const action of actions) {\n");
    script.push_str("    outputs.push(await executeAction(action));\n");
    script.push_str("  }\n");
    script.push_str("  await context.storageState({ path: storageStatePath });\n");
    script.push_str("  process.stdout.write(`${RESULT_MARKER}${JSON.stringify({ success: true, result: outputs })}\\n`);\n");
    script.push_str("} catch (error) {\n");
    script.push_str("  fail(error);\n");
    script.push_str("} ");
    script.push_str(script_epilogue());

    Ok(script)
}

async fn run_node_job(script_content: String, timeout_secs: u64) -> Result<ActionReport> {
    let temp_dir = tempfile::Builder::new()
        .prefix("postfleet-browser-job-")
        .tempdir()?;

    let script_path = temp_dir.path().join("runner.mjs");
    std::fs::write(&script_path, script_content)?;

    let args = vec![script_path.display().to_string()];

    let started = Instant::now();
    let output = run_command_capture("node", &args, None, timeout_secs).await?;
    let duration_ms = started.elapsed().as_millis() as u64;
    let (stdout, payload) = extract_result_payload(&output.stdout);

    Ok(ActionReport {
        exit_code: output.exit_code,
        duration_ms,
        stdout,
        stderr: output.stderr,
        payload,
    })
}

fn extract_result_payload(stdout: &str) -> (String, Option<Value>) {
    let mut payload: Option<Value> = None;
    let mut clean_lines = Vec::new();

    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix(RESULT_MARKER) {
            if let Ok(value) = serde_json::from_str::<Value>(rest.trim()) {
                payload = Some(value);
            }
            continue;
        }
        clean_lines.push(line.to_string());
    }

    (clean_lines.join("\n"), payload)
}

struct CommandCapture {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

async fn run_command_capture(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout_secs: u64,
) -> Result<CommandCapture> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = match timeout(Duration::from_secs(timeout_secs), command.output()).await {
        Ok(result) => result?,
        Err(_) => bail!("Command timed out after {} seconds", timeout_secs),
    };

    Ok(CommandCapture {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn detect_chromium_cache() -> bool {
    if let Ok(path) = std::env::var("PLAYWRIGHT_BROWSERS_PATH") {
        let parsed = PathBuf::from(path);
        if parsed.exists() {
            return true;
        }
    }

    let mut candidates = Vec::new();

    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(&home).join(".cache/ms-playwright"));
        candidates.push(PathBuf::from(&home).join("Library/Caches/ms-playwright"));
    }

    if let Ok(user_profile) = std::env::var("USERPROFILE") {
        candidates.push(PathBuf::from(user_profile).join("AppData/Local/ms-playwright"));
    }

    candidates.into_iter().any(|path| path.exists())
}
