//! Tenant data-encryption primitives.
//!
//! Every tenant gets a random 256-bit DEK, wrapped by the process-wide KEK
//! with AES-256-GCM and stored only as the wrapped blob. Record encryption
//! uses AES-256-GCM with a fresh 96-bit nonce; blobs are
//! `base64(nonce || ciphertext || tag)`, so decrypting with the wrong
//! tenant's DEK fails at the auth tag rather than yielding garbage.

use crate::error::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const DEK_LEN: usize = 32;

/// A freshly generated tenant key pair: the in-memory DEK and the wrapped
/// blob that may be persisted.
pub struct TenantKey {
    pub dek: Zeroizing<[u8; DEK_LEN]>,
    pub dek_encrypted: String,
}

/// Wraps and unwraps tenant DEKs with the process-wide KEK.
pub struct TenantKeyManager {
    kek: Aes256Gcm,
}

impl TenantKeyManager {
    /// Build from the base64-encoded master KEK. An invalid or missing key
    /// is a startup-fatal configuration error.
    pub fn from_base64(master_kek: &str) -> AppResult<Self> {
        let raw = BASE64
            .decode(master_kek.trim())
            .map_err(|e| AppError::InvalidConfig(format!("master KEK is not valid base64: {e}")))?;
        if raw.len() != DEK_LEN {
            return Err(AppError::InvalidConfig(format!(
                "master KEK must be {DEK_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let raw = Zeroizing::new(raw);
        let kek = Aes256Gcm::new_from_slice(&raw)
            .map_err(|_| AppError::InvalidConfig("master KEK rejected by cipher".to_string()))?;
        Ok(Self { kek })
    }

    /// Generate a random base64 KEK, for provisioning and tests.
    pub fn generate_master_kek() -> String {
        let mut raw = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut raw);
        BASE64.encode(raw)
    }

    /// Create a new random AES-256 DEK wrapped under the KEK.
    pub fn generate_tenant_key(&self) -> AppResult<TenantKey> {
        let mut dek = Zeroizing::new([0u8; DEK_LEN]);
        OsRng.fill_bytes(&mut *dek);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let wrapped = self
            .kek
            .encrypt(nonce, &dek[..])
            .map_err(|_| AppError::Integrity("DEK wrapping failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + wrapped.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&wrapped);

        Ok(TenantKey {
            dek,
            dek_encrypted: BASE64.encode(blob),
        })
    }

    /// Decrypt a stored wrapped DEK. Failure means KEK mismatch or a
    /// corrupted blob and is fatal for that tenant's data.
    pub fn unwrap_tenant_key(&self, dek_encrypted: &str) -> AppResult<Zeroizing<[u8; DEK_LEN]>> {
        let blob = BASE64
            .decode(dek_encrypted)
            .map_err(|_| AppError::Integrity("wrapped DEK is not valid base64".to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(AppError::Integrity("wrapped DEK blob too short".to_string()));
        }
        let (nonce_bytes, wrapped) = blob.split_at(NONCE_LEN);
        let raw = self
            .kek
            .decrypt(Nonce::from_slice(nonce_bytes), wrapped)
            .map_err(|_| {
                AppError::Integrity(
                    "failed to unwrap tenant DEK: master KEK mismatch or corrupt blob".to_string(),
                )
            })?;
        let raw = Zeroizing::new(raw);
        let mut dek = Zeroizing::new([0u8; DEK_LEN]);
        if raw.len() != DEK_LEN {
            return Err(AppError::Integrity("unwrapped DEK has wrong length".to_string()));
        }
        dek.copy_from_slice(&raw);
        Ok(dek)
    }
}

/// Per-record AES-256-GCM encryption with a tenant's DEK.
pub struct DataEncryptor {
    cipher: Aes256Gcm,
}

impl DataEncryptor {
    pub fn new(dek: &[u8; DEK_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(dek).expect("DEK length is fixed"),
        }
    }

    /// Encrypt to `base64(nonce || ciphertext || tag)`. Empty input stays empty.
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Internal("record encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt). Auth-tag
    /// rejection distinguishes a wrong key from plain corruption of the
    /// base64 wrapper.
    pub fn decrypt(&self, blob: &str) -> AppResult<String> {
        if blob.is_empty() {
            return Ok(String::new());
        }
        let raw = BASE64.decode(blob).map_err(|_| AppError::Decryption)?;
        if raw.len() <= NONCE_LEN {
            return Err(AppError::Decryption);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AppError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| AppError::Decryption)
    }
}
