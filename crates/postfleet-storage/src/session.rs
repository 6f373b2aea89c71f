//! Encrypted per-account session vault.
//!
//! Stores browser storage-state snapshots (cookies, local storage) keyed by
//! account id. The state blob is opaque to everything above this layer; the
//! vault only adds encryption at rest, a format version and an age check.

use crate::encryption::StateEncryptor;
use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Bumped on breaking changes to the record layout.
const SESSION_VERSION: u32 = 1;

const DEFAULT_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    account_id: String,
    storage_state: Value,
    saved_at: i64,
    version: u32,
}

/// Summary row for operator listings; never exposes the state itself.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub account_id: String,
    pub saved_at: i64,
    pub version: u32,
}

#[derive(Clone)]
pub struct SessionVault {
    db: Arc<Database>,
    cipher: StateEncryptor,
    max_age_ms: i64,
}

impl SessionVault {
    pub fn new(db: Arc<Database>, cipher: StateEncryptor) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(SESSIONS)?;
        write_txn.commit()?;

        Ok(Self {
            db,
            cipher,
            max_age_ms: DEFAULT_MAX_AGE_DAYS * 24 * 60 * 60 * 1000,
        })
    }

    pub fn with_max_age_days(mut self, days: i64) -> Self {
        self.max_age_ms = days * 24 * 60 * 60 * 1000;
        self
    }

    /// Persist a storage-state snapshot for an account.
    pub fn save(&self, account_id: &str, storage_state: &Value) -> Result<()> {
        let record = SessionRecord {
            account_id: account_id.to_string(),
            storage_state: storage_state.clone(),
            saved_at: chrono::Utc::now().timestamp_millis(),
            version: SESSION_VERSION,
        };

        let plaintext = serde_json::to_vec(&record)?;
        let sealed = self.cipher.encrypt(&plaintext)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS)?;
            table.insert(account_id, sealed.as_slice())?;
        }
        write_txn.commit()?;

        info!(account_id = %account_id, "Session saved");
        Ok(())
    }

    /// Load the storage state for an account.
    ///
    /// Absent, undecryptable, stale or version-incompatible sessions all
    /// resolve to `None`: the caller treats every one of those as "fresh
    /// login required". Stale sessions are deleted on the way out.
    pub fn load(&self, account_id: &str) -> Result<Option<Value>> {
        let sealed = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS)?;
            match table.get(account_id)? {
                Some(data) => data.value().to_vec(),
                None => return Ok(None),
            }
        };

        let plaintext = match self.cipher.decrypt(&sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Session undecryptable, treating as absent");
                return Ok(None);
            }
        };

        let record: SessionRecord =
            serde_json::from_slice(&plaintext).context("Malformed session record")?;

        if record.version > SESSION_VERSION {
            warn!(account_id = %account_id, version = record.version, "Session from newer format, ignoring");
            return Ok(None);
        }

        let age_ms = chrono::Utc::now().timestamp_millis() - record.saved_at;
        if age_ms > self.max_age_ms {
            warn!(account_id = %account_id, age_days = age_ms / 86_400_000, "Session expired, deleting");
            self.delete(account_id)?;
            return Ok(None);
        }

        Ok(Some(record.storage_state))
    }

    pub fn delete(&self, account_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS)?;
            table.remove(account_id)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<SessionMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;
        let mut sessions = Vec::new();

        for entry in table.iter()? {
            let (key, value) = entry?;
            match self.cipher.decrypt(value.value()) {
                Ok(plaintext) => {
                    if let Ok(record) = serde_json::from_slice::<SessionRecord>(&plaintext) {
                        sessions.push(SessionMeta {
                            account_id: record.account_id,
                            saved_at: record.saved_at,
                            version: record.version,
                        });
                    }
                }
                Err(e) => {
                    warn!(account_id = %key.value(), error = %e, "Skipping undecryptable session");
                }
            }
        }

        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const SECRET: &str = "vault-test-secret-0123456789abcdef";

    fn setup() -> (SessionVault, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("test.db")).unwrap());
        let cipher = StateEncryptor::from_secret(SECRET, "session-test").unwrap();
        let vault = SessionVault::new(db, cipher).unwrap();
        (vault, temp_dir)
    }

    fn state() -> Value {
        json!({
            "cookies": [{"name": "sid", "value": "abc123", "domain": ".example.com"}],
            "origins": []
        })
    }

    #[test]
    fn save_load_roundtrip() {
        let (vault, _temp_dir) = setup();

        vault.save("acct_1", &state()).unwrap();
        let loaded = vault.load("acct_1").unwrap().expect("session present");
        assert_eq!(loaded, state());
    }

    #[test]
    fn missing_account_is_none() {
        let (vault, _temp_dir) = setup();
        assert!(vault.load("acct_unknown").unwrap().is_none());
    }

    #[test]
    fn wrong_key_reads_as_absent() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("test.db")).unwrap());

        let cipher = StateEncryptor::from_secret(SECRET, "session-test").unwrap();
        let vault = SessionVault::new(db.clone(), cipher).unwrap();
        vault.save("acct_1", &state()).unwrap();
        drop(vault);

        let other = StateEncryptor::from_secret("another-secret-0123456789abcdefgh", "session-test")
            .unwrap();
        let vault = SessionVault::new(db, other).unwrap();
        assert!(vault.load("acct_1").unwrap().is_none());
    }

    #[test]
    fn expired_session_is_deleted() {
        let (vault, _temp_dir) = setup();
        let vault = vault.with_max_age_days(0);

        vault.save("acct_1", &state()).unwrap();
        // max age of zero days makes any saved session stale
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(vault.load("acct_1").unwrap().is_none());

        // second load hits the deleted path, not the stale path
        assert!(vault.load("acct_1").unwrap().is_none());
        assert!(vault.list().unwrap().is_empty());
    }

    #[test]
    fn delete_reports_presence() {
        let (vault, _temp_dir) = setup();

        vault.save("acct_1", &state()).unwrap();
        assert!(vault.delete("acct_1").unwrap());
        assert!(!vault.delete("acct_1").unwrap());
    }

    #[test]
    fn list_reports_metadata_only() {
        let (vault, _temp_dir) = setup();

        vault.save("acct_1", &state()).unwrap();
        vault.save("acct_2", &state()).unwrap();

        let mut listed = vault.list().unwrap();
        listed.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].account_id, "acct_1");
        assert_eq!(listed[0].version, SESSION_VERSION);
    }

    #[test]
    fn save_overwrites_previous_state() {
        let (vault, _temp_dir) = setup();

        vault.save("acct_1", &state()).unwrap();
        let updated = json!({"cookies": [], "origins": ["https://example.com"]});
        vault.save("acct_1", &updated).unwrap();

        let loaded = vault.load("acct_1").unwrap().unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(vault.list().unwrap().len(), 1);
    }
}
