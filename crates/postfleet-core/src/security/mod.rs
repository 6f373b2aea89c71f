//! Task-authenticity layer: HMAC signing, AEAD payload encryption, replay
//! protection and shared input validation. Verification failures are
//! security events, not task failures - they never enter the retry path.

pub mod codec;
pub mod nonce;
pub mod validate;

pub use codec::{PROTOCOL_VERSION, SignedTaskCodec, VerifyError, canonical_json, payload_hash};
pub use nonce::NonceCache;
pub use validate::{
    contains_dangerous_content, sanitize_string, scan_task_data, validate_account_id,
};
