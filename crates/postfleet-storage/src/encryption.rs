use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use rand::RngExt;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;

/// AES-256-GCM encryptor for session state at rest.
///
/// Output framing is `nonce || ciphertext`; the GCM tag doubles as the
/// integrity check, so tampered or wrong-key blobs fail to decrypt.
#[derive(Clone)]
pub struct StateEncryptor {
    cipher: Aes256Gcm,
}

impl StateEncryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(anyhow::anyhow!("Key must be 32 bytes, got {}", key.len()));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|err| anyhow::anyhow!("Invalid key length: {:?}", err))?;

        Ok(Self { cipher })
    }

    /// Derive a 256-bit key from a shared secret and a domain label.
    ///
    /// The label keeps this key separate from any other key derived from the
    /// same secret (e.g. the task-signing key).
    pub fn from_secret(secret: &str, label: &str) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(label.as_bytes());
        let key = hasher.finalize();
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| anyhow::anyhow!("Failed to encrypt state: {:?}", err))?;
        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.append(&mut ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("Ciphertext is too short"));
        }

        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|err| anyhow::anyhow!("Failed to decrypt state: {:?}", err))?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret-0123456789abcdef";

    #[test]
    fn roundtrip() {
        let enc = StateEncryptor::from_secret(SECRET, "test-v1").unwrap();
        let plaintext = b"cookie jar contents";
        let ciphertext = enc.encrypt(plaintext).unwrap();
        let decrypted = enc.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_raw_key_size() {
        let err = StateEncryptor::new(&[0u8; 31]).err().expect("31 bytes must fail");
        assert!(err.to_string().contains("32"), "error should name expected size: {err}");
    }

    #[test]
    fn labels_produce_distinct_keys() {
        let a = StateEncryptor::from_secret(SECRET, "label-a").unwrap();
        let b = StateEncryptor::from_secret(SECRET, "label-b").unwrap();

        let ciphertext = a.encrypt(b"sealed").unwrap();
        assert!(
            b.decrypt(&ciphertext).is_err(),
            "a key derived under a different label should not decrypt"
        );
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let enc = StateEncryptor::from_secret(SECRET, "test-v1").unwrap();
        let mut ciphertext = enc.encrypt(b"session state").unwrap();

        let idx = NONCE_SIZE + 1;
        assert!(ciphertext.len() > idx);
        ciphertext[idx] ^= 0xFF;

        assert!(enc.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn nonces_are_unique_per_call() {
        let enc = StateEncryptor::from_secret(SECRET, "test-v1").unwrap();
        let ct1 = enc.encrypt(b"same input").unwrap();
        let ct2 = enc.encrypt(b"same input").unwrap();
        assert_ne!(ct1, ct2);
    }
}
