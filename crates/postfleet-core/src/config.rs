//! Environment-driven worker configuration.
//!
//! Every knob has a `POSTFLEET_*` variable and a sane default; the shared
//! worker secret is the only required setting and must be at least 32
//! characters, since both the signing and encryption keys derive from it.

use crate::dispatcher::DispatcherConfig;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use anyhow::{Context, Result, bail};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub worker_secret: String,
    pub db_path: String,
    pub max_instances: usize,
    pub idle_timeout_secs: u64,
    pub max_retries: u32,
    pub signature_max_age_secs: u64,
    pub poll_interval_ms: u64,
    pub exec_timeout_secs: u64,
    pub headless: bool,
    pub portal_url: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value source. Split out from `from_env` so
    /// tests do not have to mutate process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let worker_secret = lookup("POSTFLEET_WORKER_SECRET").unwrap_or_default();
        if worker_secret.len() < MIN_SECRET_LEN {
            bail!(
                "POSTFLEET_WORKER_SECRET must be set and at least {} characters",
                MIN_SECRET_LEN
            );
        }

        let worker_id = lookup("POSTFLEET_WORKER_ID").unwrap_or_else(|| {
            format!("worker_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        });

        let db_path = match lookup("POSTFLEET_DB_PATH") {
            Some(path) => path,
            None => default_db_path()?,
        };

        let config = Self {
            worker_id,
            worker_secret,
            db_path,
            max_instances: parse_var(&lookup, "POSTFLEET_MAX_INSTANCES", 5)?,
            idle_timeout_secs: parse_var(&lookup, "POSTFLEET_IDLE_TIMEOUT_SECS", 600)?,
            max_retries: parse_var(&lookup, "POSTFLEET_MAX_RETRIES", 3)?,
            signature_max_age_secs: parse_var(&lookup, "POSTFLEET_SIGNATURE_MAX_AGE_SECS", 300)?,
            poll_interval_ms: parse_var(&lookup, "POSTFLEET_POLL_INTERVAL_MS", 1000)?,
            exec_timeout_secs: parse_var(&lookup, "POSTFLEET_EXEC_TIMEOUT_SECS", 180)?,
            headless: parse_var(&lookup, "POSTFLEET_HEADLESS", true)?,
            portal_url: lookup("POSTFLEET_PORTAL_URL")
                .unwrap_or_else(|| "https://www.example.com".to_string()),
        };

        if config.max_instances == 0 {
            bail!("POSTFLEET_MAX_INSTANCES must be at least 1");
        }
        if config.signature_max_age_secs == 0 {
            bail!("POSTFLEET_SIGNATURE_MAX_AGE_SECS must be positive");
        }

        Ok(config)
    }

    pub fn signature_max_age_ms(&self) -> i64 {
        self.signature_max_age_secs as i64 * 1000
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.max_instances,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            headless: self.headless,
            ..PoolConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.max_retries,
            ..QueueConfig::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: self.worker_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            ..DispatcherConfig::default()
        }
    }
}

fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        None => Ok(default),
    }
}

fn default_db_path() -> Result<String> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".postfleet").join("fleet.db").display().to_string())
}
