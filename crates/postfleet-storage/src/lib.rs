//! Postfleet Storage - durable layer for the worker fleet
//!
//! This crate provides the persistence layer for postfleet workers, using
//! redb as the embedded database. It exposes byte-level queue APIs so record
//! shapes stay in the core crate, plus an encrypted session vault.
//!
//! # Tables
//!
//! - `pending` / `processing` / `completed` / `failed` - task queue partitions
//! - `sessions` - encrypted per-account browser storage state

pub mod encryption;
pub mod session;
pub mod task_queue;

use anyhow::Result;
use redb::Database;
use std::sync::Arc;

pub use encryption::StateEncryptor;
pub use session::{SessionMeta, SessionVault};
pub use task_queue::{PopDecision, QueueCounts, QueueStore};

/// Domain label separating the at-rest session key from every other key
/// derived from the shared worker secret.
const SESSION_KEY_LABEL: &str = "pf-session-at-rest-v1";

/// Central storage manager that initializes all storage subsystems.
pub struct Storage {
    db: Arc<Database>,
    pub queue: QueueStore,
    pub sessions: SessionVault,
}

impl Storage {
    /// Open (or create) the database at `path` and initialize all tables.
    ///
    /// `secret` seeds the session-at-rest encryption key; it is the same
    /// shared secret the signing layer uses, under a distinct derivation
    /// label.
    pub fn open(path: &str, secret: &str) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);

        let queue = QueueStore::new(db.clone())?;
        let cipher = StateEncryptor::from_secret(secret, SESSION_KEY_LABEL)?;
        let sessions = SessionVault::new(db.clone(), cipher)?;

        Ok(Self {
            db,
            queue,
            sessions,
        })
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}
