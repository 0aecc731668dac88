//! Key-value storage with optional encryption for secret values.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under a key derived from the
//! operator-provided key file via HKDF-SHA256. Ciphertext is stored as
//! base64(nonce || box), so a value is self-contained and the database never
//! sees plaintext secrets. Templates consume decrypted values through a
//! snapshot taken before rendering, not through live store reads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{Duration, Utc};
use hkdf::Hkdf;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::models::KeyValuePairRow;
use crate::store::{Store, StoreError};

/// Default scope for keys addressed as `st2kv.system.<name>` in templates.
pub const SYSTEM_SCOPE: &str = "system";

const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"triggerd kv encryption v1";

#[derive(Debug, Error)]
pub enum KeyValueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("secret storage is disabled: no encryption key configured")]
    SecretsDisabled,
    #[error("crypto failure: {0}")]
    Crypto(String),
}

// ─── Crypto ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Crypto {
    cipher: ChaCha20Poly1305,
}

impl Crypto {
    /// Load the hex-encoded master key from `path` and derive the sealing key.
    pub fn from_key_file(path: &Path) -> Result<Self, KeyValueError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KeyValueError::Crypto(format!("read {}: {e}", path.display())))?;
        let material = hex::decode(raw.trim())
            .map_err(|e| KeyValueError::Crypto(format!("key file is not hex: {e}")))?;
        if material.len() < 16 {
            return Err(KeyValueError::Crypto("key material too short".into()));
        }
        Ok(Self::from_material(&material))
    }

    pub fn from_material(material: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, material);
        let mut key = [0u8; 32];
        // 32 bytes always fits the HKDF-SHA256 output bound.
        hk.expand(HKDF_INFO, &mut key).unwrap();
        Self {
            cipher: ChaCha20Poly1305::new((&key).into()),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, KeyValueError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| KeyValueError::Crypto(e.to_string()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&sealed);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, KeyValueError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| KeyValueError::Crypto(format!("bad ciphertext encoding: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(KeyValueError::Crypto("ciphertext too short".into()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| KeyValueError::Crypto("decryption failed".into()))?;
        String::from_utf8(plain)
            .map_err(|_| KeyValueError::Crypto("plaintext is not UTF-8".into()))
    }
}

// ─── KeyValueService ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KeyValueService {
    store: Arc<Store>,
    crypto: Option<Crypto>,
}

impl KeyValueService {
    pub fn new(store: Arc<Store>, crypto: Option<Crypto>) -> Self {
        Self { store, crypto }
    }

    /// Store a value. Secret values require an encryption key; `ttl_secs`
    /// sets an expiry after which the key reads as missing.
    pub async fn set(
        &self,
        scope: &str,
        name: &str,
        value: &str,
        secret: bool,
        ttl_secs: Option<i64>,
    ) -> Result<KeyValuePairRow, KeyValueError> {
        let stored = if secret {
            let crypto = self.crypto.as_ref().ok_or(KeyValueError::SecretsDisabled)?;
            crypto.encrypt(value)?
        } else {
            value.to_string()
        };
        let expire = ttl_secs
            .map(|ttl| (Utc::now() + Duration::seconds(ttl)).to_rfc3339());
        debug!(scope, name, secret, "storing key-value pair");
        Ok(self
            .store
            .set_kv(scope, name, &stored, secret, expire.as_deref())
            .await?)
    }

    /// Fetch a value, decrypting secrets when `decrypt` is set. Expired keys
    /// read as `NotFound`.
    pub async fn get(
        &self,
        scope: &str,
        name: &str,
        decrypt: bool,
    ) -> Result<String, KeyValueError> {
        let row = self.store.get_kv(scope, name).await?;
        if is_expired(&row) {
            return Err(StoreError::NotFound(format!("key {scope}:{name}")).into());
        }
        if row.secret {
            if !decrypt {
                return Ok(row.value);
            }
            let crypto = self.crypto.as_ref().ok_or(KeyValueError::SecretsDisabled)?;
            return crypto.decrypt(&row.value);
        }
        Ok(row.value)
    }

    pub async fn delete(&self, scope: &str, name: &str) -> Result<(), KeyValueError> {
        Ok(self.store.delete_kv(scope, name).await?)
    }

    /// Decrypted view of a scope for the `decrypt_kv` template filter. Only
    /// live secret keys appear; plain keys are excluded since templates read
    /// those through `st2kv`.
    pub async fn decrypted_snapshot(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, String>, KeyValueError> {
        let mut out = HashMap::new();
        let Some(crypto) = self.crypto.as_ref() else {
            return Ok(out);
        };
        for row in self.store.list_kv_by_scope(scope).await? {
            if row.secret && !is_expired(&row) {
                out.insert(row.name.clone(), crypto.decrypt(&row.value)?);
            }
        }
        Ok(out)
    }

    /// The `st2kv` template namespace: plain values as stored, secret values
    /// masked with their ciphertext.
    pub async fn template_context(&self, scope: &str) -> Result<Value, KeyValueError> {
        let mut map = serde_json::Map::new();
        for row in self.store.list_kv_by_scope(scope).await? {
            if !is_expired(&row) {
                map.insert(row.name.clone(), Value::String(row.value));
            }
        }
        Ok(json!({ scope: map }))
    }
}

fn is_expired(row: &KeyValuePairRow) -> bool {
    match &row.expire_timestamp {
        Some(ts) => ts.as_str() < Utc::now().to_rfc3339().as_str(),
        None => false,
    }
}
