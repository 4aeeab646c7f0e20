use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;

use crate::services::storage::{BlobStore, StorageError};

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for face photos at rest.
///
/// Each object is bound to its storage key through the associated data, so a
/// sealed blob copied under another key fails to open.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Output layout: 12-byte nonce followed by the ciphertext.
    pub fn seal(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(output)
    }

    pub fn open(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if sealed.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

/// Blob store decorator that seals every object before it leaves the process.
pub struct SealedBlobStore {
    inner: Arc<dyn BlobStore>,
    encryption: EncryptionService,
}

impl SealedBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, encryption: EncryptionService) -> Self {
        Self { inner, encryption }
    }
}

#[async_trait]
impl BlobStore for SealedBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let sealed = self.encryption.seal(key, data)?;
        self.inner
            .put(key, &sealed, "application/octet-stream")
            .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let sealed = self.inner.get(key).await?;
        Ok(self.encryption.open(key, &sealed)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}
