//! Signing, verification and payload encryption for queued tasks.
//!
//! Producer and worker share one secret; both keys are derived from it under
//! distinct labels. The signing string is the pipe-joined sequence
//! `task_id|type|account_id|timestamp|nonce|data_hash` - field order and
//! separator are part of the wire contract.

use crate::models::{SignedTask, Task};
use crate::security::NonceCache;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngExt;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const PROTOCOL_VERSION: &str = "1.0";

/// Domain label separating the payload-encryption key from the signing key.
const ENCRYPTION_KEY_LABEL: &str = "pf-encryption-v1";

/// Tolerated clock skew for timestamps ahead of local time.
const FUTURE_SKEW_MS: i64 = 60_000;

const MIN_SECRET_LEN: usize = 32;
const GCM_NONCE_SIZE: usize = 12;
const GCM_TAG_SIZE: usize = 16;

/// Why a signed task was rejected. Every variant is fatal for the task at
/// hand - a task that failed verification is never retried.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),
    #[error("signature expired ({age_ms} ms old)")]
    SignatureExpired { age_ms: i64 },
    #[error("timestamp in future ({skew_ms} ms ahead)")]
    TimestampInFuture { skew_ms: i64 },
    #[error("nonce already used (replay)")]
    ReplayDetected,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("data integrity check failed")]
    IntegrityCheckFailed,
    #[error("payload decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Signs outgoing tasks and verifies/decrypts incoming ones. Owns the
/// replay-nonce cache; everything else is stateless key material.
pub struct SignedTaskCodec {
    signing_key: [u8; 32],
    cipher: Aes256Gcm,
    max_age_ms: i64,
    nonces: NonceCache,
}

impl SignedTaskCodec {
    pub fn new(secret: &str, max_age_ms: i64) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(anyhow::anyhow!(
                "Worker secret must be at least {} characters",
                MIN_SECRET_LEN
            ));
        }

        let signing_key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(ENCRYPTION_KEY_LABEL.as_bytes());
        let encryption_key = hasher.finalize();
        let cipher = Aes256Gcm::new_from_slice(&encryption_key)
            .map_err(|e| anyhow::anyhow!("Invalid derived key: {:?}", e))?;

        Ok(Self {
            signing_key,
            cipher,
            max_age_ms,
            nonces: NonceCache::new(),
        })
    }

    /// Wrap a task for transmission. `encrypt_sensitive` replaces the
    /// payload with AEAD ciphertext and the `{"encrypted": true}` sentinel.
    pub fn sign(&self, task: &Task, encrypt_sensitive: bool) -> Result<SignedTask> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let nonce_bytes: [u8; 16] = rand::rng().random();
        self.sign_at(task, encrypt_sensitive, timestamp, hex::encode(nonce_bytes))
    }

    fn sign_at(
        &self,
        task: &Task,
        encrypt_sensitive: bool,
        timestamp: i64,
        nonce: String,
    ) -> Result<SignedTask> {
        // Hash the plaintext payload regardless of encryption: the hash
        // binds task metadata to the payload inside the signature even when
        // the AEAD tag already covers the ciphertext.
        let data_hash = payload_hash(&task.data);

        let should_encrypt = encrypt_sensitive
            && task
                .data
                .as_object()
                .map(|map| !map.is_empty())
                .unwrap_or(!task.data.is_null());

        let (data, encrypted_payload) = if should_encrypt {
            let sealed = self.encrypt_payload(&canonical_json(&task.data))?;
            (json!({"encrypted": true}), Some(sealed))
        } else {
            (task.data.clone(), None)
        };

        let signing_string = signing_string(
            &task.id,
            task.task_type.as_str(),
            &task.account_id,
            timestamp,
            &nonce,
            &data_hash,
        );
        let signature = self.hmac_hex(&signing_string);

        Ok(SignedTask {
            task_id: task.id.clone(),
            task_type: task.task_type,
            account_id: task.account_id.clone(),
            data,
            data_hash,
            priority: task.priority,
            created_at: task.created_at,
            retry_count: task.retry_count,
            signature,
            timestamp,
            nonce,
            protocol_version: PROTOCOL_VERSION.to_string(),
            encrypted_payload,
        })
    }

    /// Verify a signed task and recover the plaintext Task.
    pub fn verify(&self, signed: &SignedTask) -> Result<Task, VerifyError> {
        if signed.protocol_version != PROTOCOL_VERSION {
            return Err(VerifyError::ProtocolVersionMismatch(
                signed.protocol_version.clone(),
            ));
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let age_ms = now_ms - signed.timestamp;
        if age_ms > self.max_age_ms {
            return Err(VerifyError::SignatureExpired { age_ms });
        }
        if age_ms < -FUTURE_SKEW_MS {
            return Err(VerifyError::TimestampInFuture { skew_ms: -age_ms });
        }

        if self.nonces.contains(&signed.task_id, &signed.nonce) {
            return Err(VerifyError::ReplayDetected);
        }

        let signing_string = signing_string(
            &signed.task_id,
            signed.task_type.as_str(),
            &signed.account_id,
            signed.timestamp,
            &signed.nonce,
            &signed.data_hash,
        );

        let received = hex::decode(&signed.signature).map_err(|_| VerifyError::InvalidSignature)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(signing_string.as_bytes());
        mac.verify_slice(&received)
            .map_err(|_| VerifyError::InvalidSignature)?;

        // Only record the nonce for signatures that actually verified, so
        // forged probes cannot poison the cache.
        if !self.nonces.insert(&signed.task_id, &signed.nonce, now_ms) {
            return Err(VerifyError::ReplayDetected);
        }

        let data = match &signed.encrypted_payload {
            Some(sealed) => {
                // AEAD tag covers integrity here; the redundant hash check
                // applies to the plaintext path only.
                let plaintext = self.decrypt_payload(sealed)?;
                serde_json::from_str(&plaintext)
                    .map_err(|e| VerifyError::DecryptionFailed(e.to_string()))?
            }
            None => {
                if payload_hash(&signed.data) != signed.data_hash {
                    return Err(VerifyError::IntegrityCheckFailed);
                }
                signed.data.clone()
            }
        };

        Ok(Task {
            id: signed.task_id.clone(),
            task_type: signed.task_type,
            account_id: signed.account_id.clone(),
            data,
            priority: signed.priority,
            created_at: signed.created_at,
            retry_count: signed.retry_count,
        })
    }

    /// Drop replay-cache entries older than the signature max-age.
    /// Anything that old is already rejected unconditionally by the age
    /// check, so this bounds memory without weakening the guarantee.
    pub fn gc_nonces(&self) -> usize {
        self.nonces
            .gc(self.max_age_ms, chrono::Utc::now().timestamp_millis())
    }

    pub fn nonce_cache_len(&self) -> usize {
        self.nonces.len()
    }

    fn hmac_hex(&self, signing_string: &str) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(signing_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// AES-256-GCM, framed as `iv_b64:tag_b64:ciphertext_b64`.
    fn encrypt_payload(&self, plaintext: &str) -> Result<String> {
        let iv: [u8; GCM_NONCE_SIZE] = rand::rng().random();
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to encrypt payload: {:?}", e))?;

        let tag = sealed.split_off(sealed.len() - GCM_TAG_SIZE);
        Ok(format!(
            "{}:{}:{}",
            BASE64.encode(iv),
            BASE64.encode(tag),
            BASE64.encode(sealed)
        ))
    }

    fn decrypt_payload(&self, sealed: &str) -> Result<String, VerifyError> {
        let malformed = |reason: &str| VerifyError::DecryptionFailed(reason.to_string());

        let parts: Vec<&str> = sealed.split(':').collect();
        if parts.len() != 3 {
            return Err(malformed("expected iv:tag:ciphertext"));
        }

        let iv = BASE64.decode(parts[0]).map_err(|_| malformed("bad iv encoding"))?;
        let tag = BASE64.decode(parts[1]).map_err(|_| malformed("bad tag encoding"))?;
        let mut ciphertext = BASE64
            .decode(parts[2])
            .map_err(|_| malformed("bad ciphertext encoding"))?;
        if iv.len() != GCM_NONCE_SIZE || tag.len() != GCM_TAG_SIZE {
            return Err(malformed("bad iv or tag length"));
        }

        ciphertext.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| malformed("authentication failed"))?;

        String::from_utf8(plaintext).map_err(|_| malformed("payload is not utf-8"))
    }
}

fn signing_string(
    task_id: &str,
    task_type: &str,
    account_id: &str,
    timestamp: i64,
    nonce: &str,
    data_hash: &str,
) -> String {
    [
        task_id,
        task_type,
        account_id,
        &timestamp.to_string(),
        nonce,
        data_hash,
    ]
    .join("|")
}

/// Canonical JSON for hashing. serde_json keeps object keys in sorted order,
/// so compact serialization is already deterministic.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Hex SHA-256 over the canonical payload serialization.
pub fn payload_hash(data: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(data).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use serde_json::json;

    const MAX_AGE_MS: i64 = 5 * 60 * 1000;

    fn codec() -> SignedTaskCodec {
        SignedTaskCodec::new(&"S".repeat(32), MAX_AGE_MS).unwrap()
    }

    fn task() -> Task {
        Task {
            id: "t1".to_string(),
            task_type: TaskType::PostVehicle,
            account_id: "acct_1".to_string(),
            data: json!({"price": 100}),
            priority: 5,
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    #[test]
    fn secret_shorter_than_32_rejected() {
        assert!(SignedTaskCodec::new("short", MAX_AGE_MS).is_err());
        assert!(SignedTaskCodec::new(&"S".repeat(32), MAX_AGE_MS).is_ok());
    }

    #[test]
    fn sign_verify_roundtrip_plaintext() {
        let codec = codec();
        let task = task();

        let signed = codec.sign(&task, false).unwrap();
        assert!(signed.encrypted_payload.is_none());
        assert_eq!(signed.data, json!({"price": 100}));

        let verified = codec.verify(&signed).unwrap();
        assert_eq!(verified.data, json!({"price": 100}));
        assert_eq!(verified.id, "t1");
        assert_eq!(verified.account_id, "acct_1");
    }

    #[test]
    fn sign_verify_roundtrip_encrypted() {
        let codec = codec();
        let task = task();

        let signed = codec.sign(&task, true).unwrap();
        assert_eq!(signed.data, json!({"encrypted": true}));
        let sealed = signed.encrypted_payload.as_ref().expect("payload sealed");
        assert_eq!(sealed.split(':').count(), 3);

        let verified = codec.verify(&signed).unwrap();
        assert_eq!(verified.data, json!({"price": 100}));
    }

    #[test]
    fn flipped_signature_char_fails() {
        let codec = codec();
        let mut signed = codec.sign(&task(), false).unwrap();

        let flipped = if signed.signature.as_bytes()[0] == b'a' { 'b' } else { 'a' };
        signed.signature.replace_range(0..1, &flipped.to_string());

        let err = codec.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidSignature), "got {err:?}");
    }

    #[test]
    fn replay_rejected_on_second_verify() {
        let codec = codec();
        let signed = codec.sign(&task(), true).unwrap();

        codec.verify(&signed).unwrap();
        let err = codec.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::ReplayDetected), "got {err:?}");
    }

    #[test]
    fn failed_signature_does_not_burn_nonce() {
        let codec = codec();
        let signed = codec.sign(&task(), false).unwrap();

        let mut forged = signed.clone();
        forged.signature = "00".repeat(32);
        assert!(matches!(
            codec.verify(&forged).unwrap_err(),
            VerifyError::InvalidSignature
        ));

        // the genuine task still verifies
        codec.verify(&signed).unwrap();
    }

    #[test]
    fn tampered_plaintext_data_detected() {
        let codec = codec();
        let mut signed = codec.sign(&task(), false).unwrap();
        signed.data = json!({"price": 1});

        let err = codec.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::IntegrityCheckFailed), "got {err:?}");
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let codec = codec();
        let mut signed = codec.sign(&task(), true).unwrap();

        let sealed = signed.encrypted_payload.take().unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(String::from).collect();
        let mut ct = BASE64.decode(&parts[2]).unwrap();
        ct[0] ^= 0xFF;
        parts[2] = BASE64.encode(ct);
        signed.encrypted_payload = Some(parts.join(":"));

        let err = codec.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::DecryptionFailed(_)), "got {err:?}");
    }

    #[test]
    fn expired_signature_rejected_even_when_valid() {
        let strict = SignedTaskCodec::new(&"S".repeat(32), 1).unwrap();
        let signed = strict.sign(&task(), false).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let err = strict.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureExpired { .. }), "got {err:?}");
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let codec = codec();
        let future = chrono::Utc::now().timestamp_millis() + FUTURE_SKEW_MS + 10_000;
        let signed = codec
            .sign_at(&task(), false, future, "ab".repeat(16))
            .unwrap();

        let err = codec.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::TimestampInFuture { .. }), "got {err:?}");
    }

    #[test]
    fn small_future_skew_tolerated() {
        let codec = codec();
        let nearby = chrono::Utc::now().timestamp_millis() + 5_000;
        let signed = codec
            .sign_at(&task(), false, nearby, "cd".repeat(16))
            .unwrap();
        codec.verify(&signed).unwrap();
    }

    #[test]
    fn protocol_version_checked_first() {
        let codec = codec();
        let mut signed = codec.sign(&task(), false).unwrap();
        signed.protocol_version = "0.9".to_string();

        let err = codec.verify(&signed).unwrap_err();
        match err {
            VerifyError::ProtocolVersionMismatch(got) => assert_eq!(got, "0.9"),
            other => panic!("got {other:?}"),
        }
    }

    #[test]
    fn wrong_secret_cannot_verify() {
        let signer = codec();
        let verifier = SignedTaskCodec::new(&"T".repeat(32), MAX_AGE_MS).unwrap();

        let signed = signer.sign(&task(), false).unwrap();
        let err = verifier.verify(&signed).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidSignature), "got {err:?}");
    }

    #[test]
    fn empty_payload_is_not_encrypted() {
        let codec = codec();
        let mut empty = task();
        empty.data = json!({});

        let signed = codec.sign(&empty, true).unwrap();
        assert!(signed.encrypted_payload.is_none());
        assert_eq!(signed.data, json!({}));
        codec.verify(&signed).unwrap();
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
        // same object built in another order hashes identically
        let b: Value = serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#).unwrap();
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn nonce_gc_drops_only_aged_entries() {
        let codec = codec();
        for i in 0..5 {
            let mut t = task();
            t.id = format!("t{}", i);
            let signed = codec.sign(&t, false).unwrap();
            codec.verify(&signed).unwrap();
        }
        assert_eq!(codec.nonce_cache_len(), 5);

        // nothing is older than the age window yet, so nothing goes
        assert_eq!(codec.gc_nonces(), 0);
        assert_eq!(codec.nonce_cache_len(), 5);
    }

    #[test]
    fn signing_string_layout_is_fixed() {
        let s = signing_string("t1", "post_vehicle", "acct_1", 1700, "n0nce", "deadbeef");
        assert_eq!(s, "t1|post_vehicle|acct_1|1700|n0nce|deadbeef");
    }
}
